use std::time::Duration;

use murmur_server::{serve, AdmissionConfig, AdmissionTable, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_server=debug")),
        )
        .init();

    info!("Starting murmur admission server v{}", env!("CARGO_PKG_VERSION"));

    let config = AdmissionConfig::from_env();
    info!(?config, "Loaded configuration");

    let admission = AdmissionTable::new(config.max_active, config.lease_ttl);

    // Heartbeats purge on their own; this keeps /health honest when traffic stops.
    let table = admission.clone();
    let sweep = config.lease_ttl.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep);
        loop {
            interval.tick().await;
            table.purge_stale(murmur_shared::now_millis()).await;
        }
    });

    tokio::select! {
        result = serve(AppState { admission }, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
