use anyhow::{Context, Result};
use garagesync::client::ApiClient;
use garagesync::config::load_config;
use garagesync::coordinator::Coordinator;
use garagesync::session::{Credentials, SessionManager};
use garagesync::subscription::SyncEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "garagesync=info".into()),
        )
        .init();

    info!("GarageSync starting...");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "garagesync.toml".to_string());
    let config = load_config(&config_path)
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    info!(
        base_url = %config.service.base_url,
        interval_seconds = config.sync.interval_seconds,
        "Configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.sync.request_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;

    let session = Arc::new(SessionManager::new(
        Credentials::from_config(&config.service),
        http,
    ));
    let client = Arc::new(ApiClient::new(session));
    let coordinator = Arc::new(Coordinator::new(config.sync, client));

    // Log refresh outcomes for operators
    let (_handle, mut events) = coordinator.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::SnapshotPublished(snapshot) => info!(
                    vehicles = snapshot.vehicle_count(),
                    entities = snapshot.entity_descriptors().len(),
                    "Snapshot updated"
                ),
                SyncEvent::RefreshFailed(err) => error!(error = %err, "Refresh failed"),
            }
        }
    });

    let scheduler = coordinator.start();

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    coordinator.shutdown();
    let _ = scheduler.await;
    event_logger.abort();
    info!("GarageSync stopped");

    Ok(())
}
