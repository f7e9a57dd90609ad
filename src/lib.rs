// Service configuration
pub mod config;

// Session handling and authenticated requests
pub mod session;

// Typed garage service API client
pub mod client;

// Published vehicle facts model and normalization
pub mod snapshot;

// Refresh scheduling, snapshot cache and failure isolation
pub mod coordinator;

// Subscriber notification
pub mod subscription;

// Setup-time validation
pub mod setup;
