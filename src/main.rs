use anyhow::Result;
use tracing::info;

use vidcache::{Config, Services};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidcache=info".parse()?),
        )
        .init();

    let config = match Config::locate(std::env::args().nth(1)) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    info!(
        video_root = ?config.video_root,
        image_root = ?config.image_root,
        data_dir = ?config.data_dir,
        "Starting vidcache"
    );

    let services = Services::open(config)?;
    let stats = services.store.stats()?;
    info!(?stats, degraded = services.store.is_degraded(), "Store opened");

    let report = services.startup().await?;
    info!(?report, "Startup reconciliation applied");

    let tasks = services.start_background()?;
    info!("Watching for changes, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    tokio::task::spawn_blocking(move || {
        services.shutdown();
        tasks.join();
    })
    .await?;

    Ok(())
}
