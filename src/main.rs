use build_cache::{
    cache_index::{CacheIndex, LruDiskIndex},
    config::Config,
    http_cache::HttpCache,
    logging::LoggerManager,
    server::CacheServer,
    shutdown::ShutdownCoordinator,
    space_ensurer::EvictingSpaceEnsurer,
    CacheError, Result,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let mut logger = LoggerManager::new(config.logging.clone());
    logger.initialize()?;

    info!("Starting build cache v{}", env!("CARGO_PKG_VERSION"));

    let index = Arc::new(LruDiskIndex::new(&config.cache.dir, config.cache.max_size));
    index.ensure_layout()?;
    index.load_existing_objects()?;
    info!(
        "Loaded {} existing cache items from {} (max size {} bytes)",
        index.object_count(),
        config.cache.dir.display(),
        index.max_size_bytes()
    );

    let cache = Arc::new(HttpCache::new(
        index,
        Arc::new(EvictingSpaceEnsurer::new()),
        config.server.status_path.clone(),
    ));

    let host: IpAddr = config.server.host.parse().map_err(|e| {
        CacheError::ConfigError(format!(
            "Invalid listen address {}: {}",
            config.server.host, e
        ))
    })?;
    let listen_addr = SocketAddr::new(host, config.server.port);
    let server = CacheServer::new(listen_addr, cache);

    let shutdown_coordinator = ShutdownCoordinator::new();
    let server_shutdown = shutdown_coordinator.subscribe();

    tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown listener failed: {}", e);
        }
    });

    server.start(server_shutdown).await?;

    info!("Build cache shutdown complete");
    Ok(())
}
