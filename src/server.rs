use crate::cache::ResponseCache;
use crate::config::Config;
use crate::dialer::TcpDialer;
use crate::error::ProxyError;
use crate::handler::{ConnectionHandler, HandlerSettings};
use crate::stats::ProxyStats;
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
}

impl ProxyServer {
    /// Builds the cache and dialer from `config` and binds the listening socket.
    pub async fn bind(config: &Config) -> Result<Self, ProxyError> {
        let cache = Arc::new(ResponseCache::new(&config.cache)?);
        debug!(
            "Cache enabled: {}, ttl: {:?}, max entries: {:?}, disk: {:?}",
            config.cache.enabled, config.cache.ttl_secs, config.cache.max_entries, config.cache.disk_dir
        );
        let handler = ConnectionHandler::new(
            cache,
            Arc::new(TcpDialer),
            Arc::new(ProxyStats::new()),
            HandlerSettings::from(config),
        );
        Self::bind_with(config.listen_addr, Arc::new(handler)).await
    }

    pub async fn bind_with(addr: SocketAddr, handler: Arc<ConnectionHandler>) -> Result<Self, ProxyError> {
        info!("Binding forward proxy listener to: {}", addr);
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind {}: {}", addr, e);
            ProxyError::Io(e)
        })?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handler(&self) -> &Arc<ConnectionHandler> {
        &self.handler
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// being handled keep running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        info!("HTTP forward proxy listening on: {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // usually fd exhaustion; the listener itself is still fine
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let handler = self.handler.clone();
            tokio::spawn(async move {
                let stats = handler.stats().clone();
                stats.connection_opened();
                debug!("Accepted connection from {}", peer);
                let _ = stream.set_nodelay(true);

                match handler.handle(stream).await {
                    Ok(outcome) => debug!("Connection from {} finished: {:?}", peer, outcome),
                    Err(e) => {
                        stats.connection_failed();
                        match &e {
                            ProxyError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                                debug!("Connection from {} closed early: {}", peer, e)
                            }
                            ProxyError::InvalidRequest(_) => info!("Bad request from {}: {}", peer, e),
                            _ => warn!("Connection from {} failed: {}", peer, e),
                        }
                    }
                }
                stats.connection_closed();
            });
        }

        info!("Stopped accepting connections; {}", self.handler.stats().snapshot());
        Ok(())
    }
}
