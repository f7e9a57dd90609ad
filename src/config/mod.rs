use serde::Deserialize;

/// Complete GarageSync configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GarageConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Remote garage service connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the garage service (e.g. "http://garage.local:8080")
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// Refresh scheduling and fetch tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Nominal interval between automatic refreshes (seconds)
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Maximum concurrent category fetches within one cycle
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Cap on the hard-failure backoff delay (seconds)
    #[serde(default = "default_backoff_cap_seconds")]
    pub backoff_cap_seconds: u64,
}

fn default_interval_seconds() -> u64 {
    300
}

fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_backoff_cap_seconds() -> u64 {
    3600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
            concurrency_limit: default_concurrency_limit(),
            backoff_cap_seconds: default_backoff_cap_seconds(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<GarageConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: GarageConfig = toml::from_str(&contents)?;
    Ok(config)
}
