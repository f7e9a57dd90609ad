//! Setup-time validation boundary.
//!
//! Performs one authenticate + one lightweight fetch against the configured
//! service so a setup wizard can distinguish "unreachable or broken" from
//! "wrong credentials" before a coordinator is ever created.

use crate::client::{ApiClient, FetchError};
use crate::session::{Credentials, SessionManager};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Setup validation failure, surfaced synchronously to the initiating user.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupError {
    /// The service could not be reached or did not behave like one
    CannotConnect(String),
    /// The service rejected the supplied credentials
    InvalidAuth,
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::CannotConnect(msg) => write!(f, "cannot connect: {}", msg),
            SetupError::InvalidAuth => write!(f, "invalid credentials"),
        }
    }
}

impl std::error::Error for SetupError {}

/// Result of a successful setup validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupInfo {
    /// Display title for the configured instance
    pub title: String,
    /// Vehicles visible with the supplied credentials
    pub vehicle_count: usize,
}

/// Validate reachability and credential correctness.
///
/// One login plus one vehicle-list fetch; any auth rejection maps to
/// [`SetupError::InvalidAuth`], everything else to
/// [`SetupError::CannotConnect`].
pub async fn validate_setup(
    credentials: Credentials,
    timeout: Duration,
) -> Result<SetupInfo, SetupError> {
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SetupError::CannotConnect(e.to_string()))?;

    let base_url = credentials.base_url().to_string();
    let session = Arc::new(SessionManager::new(credentials, http));
    let client = ApiClient::new(session);

    match client.vehicles().await {
        Ok(vehicles) => {
            info!(
                base_url = %base_url,
                vehicles = vehicles.len(),
                "Setup validation succeeded"
            );
            Ok(SetupInfo {
                title: format!("Garage ({})", base_url),
                vehicle_count: vehicles.len(),
            })
        }
        Err(FetchError::Auth) => Err(SetupError::InvalidAuth),
        Err(err) => Err(SetupError::CannotConnect(err.to_string())),
    }
}
