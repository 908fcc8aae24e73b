//! TCP accept server
//!
//! Binds the shared acceptance port and spawns the dispatcher for every
//! connection. A bind failure is the only fatal error the proxy knows;
//! accept errors are logged and the loop continues.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::handler::Handler;
use crate::registry::Registry;
use crate::session::Manager;

/// Listens for all connections, devices and clients
pub struct Server {
    cfg: Arc<Config>,
    handler: Arc<Handler>,
    listener: TcpListener,
}

impl Server {
    /// Bind the acceptance port. Failing to bind is fatal and propagates
    /// to the process exit status.
    pub async fn bind(
        cfg: Arc<Config>,
        registry: Arc<Registry>,
        sessions: Arc<Manager>,
    ) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        info!("listening on {}", addr);
        if cfg.proxy_protocol {
            info!("PROXY protocol enabled");
        }

        let handler = Arc::new(Handler::new(cfg.clone(), registry, sessions));
        Ok(Self {
            cfg,
            handler,
            listener,
        })
    }

    /// Actual bound address, useful when the configured port is 0
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown token fires. In-flight
    /// sessions are not forcibly terminated; they end when their
    /// transports close.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("listener on port {} shutting down", self.cfg.port);
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let handler = self.handler.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(stream, peer_addr, conn_shutdown).await {
                                error!("error handling connection from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                },
            }
        }
    }
}
