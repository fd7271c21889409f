//! Client-facing TCP server

use crate::connection::Connection;
use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Accepts client connections, each served on its own task
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    listener: TcpListener,
    slots: Arc<Semaphore>,
}

impl ProxyServer {
    /// Bind the configured listen address
    pub async fn bind(ctx: Arc<ProxyContext>) -> Result<Self> {
        let address = ctx.config.listen_address.clone();
        Self::bind_to(ctx, &address).await
    }

    /// Bind an explicit address, e.g. `127.0.0.1:0` in tests
    pub async fn bind_to(ctx: Arc<ProxyContext>, address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            ProxyError::ConfigError(format!("cannot listen on {}: {}", address, e))
        })?;
        let slots = Arc::new(Semaphore::new(ctx.config.max_connections));
        Ok(ProxyServer {
            ctx,
            listener,
            slots,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Accept clients until shutdown
    ///
    /// Once the connection limit is reached, accepting pauses until a
    /// connection closes.
    pub async fn run(self) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        let ctx = Arc::clone(&self.ctx);
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = ctx.wait_shutdown() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
                _ = ctx.wait_shutdown() => break,
            };

            let conn = Connection::new(Arc::clone(&self.ctx), peer);
            tokio::spawn(async move {
                conn.serve(stream).await;
                drop(permit);
            });
        }
        debug!("Accept loop stopped");
        Ok(())
    }
}
