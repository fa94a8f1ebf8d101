use std::sync::Arc;

use anyhow::Context;
use reef_worker::{
    Config, InMemoryLibraryStore, LibraryStore, MusicLibrary, Pipeline, ScanJob, ScanTrigger,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reef_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!(
        environment = %config.environment(),
        library = %config.music_library_path().display(),
        work_dir = %config.transcode().work_dir.display(),
        "Starting Reef worker"
    );

    config
        .transcode()
        .prepare_work_dir()
        .context("Failed to create transcode work directory")?;

    let store = Arc::new(InMemoryLibraryStore::new());
    let library = MusicLibrary::new(config.music_library_path().clone());
    store.register_library(library.clone()).await?;

    let pipeline = Pipeline::builder(store).with_config(&config).build();
    let handles = pipeline.spawn_workers()?;

    pipeline
        .enqueue_scan(ScanJob::full(library, ScanTrigger::LibraryAdded))
        .await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    pipeline.shutdown(handles).await;
    Ok(())
}
