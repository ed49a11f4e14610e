use std::sync::Arc;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use sonoscope_app::api::{self, AppState};
use sonoscope_app::{DeviceManager, ServerConfig};

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all("logs")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "sonoscope.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();

    // Keep guard alive for the entire program
    std::mem::forget(guard);

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging().map_err(|e| anyhow::anyhow!("logging setup failed: {}", e))?;

    let config = ServerConfig::from_env()?;
    tracing::info!(
        sample_rate = config.manager.audio_defaults.sample_rate,
        fft_size = config.manager.audio_defaults.fft_size,
        "Starting sonoscope"
    );

    let manager = Arc::new(DeviceManager::new(config.manager.clone()));

    // Seed the registry before the first client asks.
    let devices = manager.refresh_devices().await;
    tracing::info!(count = devices.len(), "Input devices enumerated");
    for device in &devices {
        tracing::info!(
            stable_id = %device.descriptor.stable_id,
            name = %device.descriptor.name,
            status = device.status,
            "  device"
        );
    }

    let app = api::router(AppState {
        manager: manager.clone(),
    });

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    Ok(())
}

async fn shutdown_signal(manager: Arc<DeviceManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown requested, stopping pipelines");
    manager.stop_all().await;
    if let Err(e) = manager.registry().persist() {
        tracing::warn!("Final registry persist failed: {}", e);
    }
}
