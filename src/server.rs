//! HTTP Server Module
//!
//! Accept loop that serves every connection with hyper's HTTP/1 implementation
//! and hands each request to the [`HttpCache`].

use crate::http_cache::HttpCache;
use crate::shutdown::ShutdownSignal;
use crate::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// How long in-progress connections may run after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CacheServer {
    listen_addr: SocketAddr,
    cache: Arc<HttpCache>,
    active_connections: Arc<AtomicUsize>,
}

impl CacheServer {
    pub fn new(listen_addr: SocketAddr, cache: Arc<HttpCache>) -> Self {
        Self {
            listen_addr,
            cache,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the listen address and serve until shutdown.
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener, shutdown_signal).await
    }

    /// Serve on an already bound listener until shutdown, then drain.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_signal: ShutdownSignal,
    ) -> Result<()> {
        info!("Build cache listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            // Set TCP_NODELAY to disable Nagle's algorithm for lower latency
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let cache = Arc::clone(&self.cache);
                            let active_connections = Arc::clone(&self.active_connections);
                            tokio::spawn(Self::serve_connection(
                                stream,
                                addr,
                                cache,
                                active_connections,
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("Received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        self.drain().await;
        info!("Build cache stopped");
        Ok(())
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    async fn drain(&self) {
        let active = self.active_connections();
        if active == 0 {
            return;
        }

        info!(
            "Draining {} active connections (timeout: {:?})",
            active, DRAIN_TIMEOUT
        );
        let drain_start = std::time::Instant::now();
        while self.active_connections() > 0 && drain_start.elapsed() < DRAIN_TIMEOUT {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.active_connections();
        if remaining > 0 {
            warn!("Shutting down with {} connections still active", remaining);
        } else {
            info!("All connections drained");
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        cache: Arc<HttpCache>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let remote_addr = addr.to_string();
        let service = service_fn(move |req| {
            let cache = Arc::clone(&cache);
            let remote_addr = remote_addr.clone();
            async move { Ok::<_, Infallible>(cache.handle(req, &remote_addr).await) }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            if err.is_incomplete_message() || err.is_canceled() {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
