use media_relay::{
    catalog::CatalogFile,
    config::Config,
    context::RelayContext,
    eviction::EvictionSweeper,
    http_server::HttpServer,
    logging::LoggerManager,
    pipeline::{PipelineSettings, StreamPipeline},
    shutdown::ShutdownCoordinator,
    upstream::HttpRemoteSource,
    Result,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let mut logger = LoggerManager::from_config(&config.logging, hostname);
    logger.initialize()?;

    info!(
        "Starting media relay v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!(
        "Disk cache: dir={}, max_size={}MB",
        config.cache.cache_dir.display(),
        config.cache.max_cache_size / 1024 / 1024
    );

    let context = RelayContext::from_config(&config).await?;
    let catalog = CatalogFile::load(config.catalog.path.clone()).await?;
    if catalog.is_empty() {
        warn!(
            "Catalog {:?} has no records, stream requests will return 404",
            catalog.path()
        );
        // Leave a versioned empty snapshot for operators to fill in
        if !catalog.path().exists() {
            if let Err(e) = catalog.save().await {
                warn!("Failed to write empty catalog {:?}: {}", catalog.path(), e);
            }
        }
    }
    info!(
        "Catalog loaded: path={:?}, records={}",
        catalog.path(),
        catalog.len()
    );
    let remote = HttpRemoteSource::new(
        &config.upstream.base_url,
        config.upstream.request_timeout,
        config.upstream.pool_idle_timeout,
    )?;
    let pipeline = StreamPipeline::new(
        context.clone(),
        catalog,
        remote,
        PipelineSettings {
            chunk_size: config.cache.chunk_size,
            chunk_timeout: config.upstream.chunk_timeout,
        },
    );

    // Initialize shutdown coordinator
    let mut shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    shutdown_coordinator.set_context(context.clone());

    // Start background eviction sweeper
    let sweeper = EvictionSweeper::new(
        context.store.clone(),
        config.cache.max_cache_size,
        config.cache.cleanup_interval,
    );
    let sweeper_task = tokio::spawn(sweeper.run(shutdown_coordinator.signal()));

    let http_addr = SocketAddr::new(config.server.bind_address, config.server.http_port);
    let http_server = HttpServer::new(http_addr, pipeline);
    let http_shutdown = shutdown_coordinator.signal();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.start(http_shutdown).await {
            error!("HTTP server failed: {}", e);
        }
    });

    // Start shutdown listener
    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    shutdown_task.await.ok();
    info!("Shutdown coordinator completed, waiting for server tasks");

    // Give server tasks a moment to finish after receiving their shutdown signals
    let _ = tokio::time::timeout(Duration::from_secs(6), async {
        http_task.await.ok();
        sweeper_task.await.ok();
    })
    .await;

    info!("Media relay shutdown complete");
    Ok(())
}
