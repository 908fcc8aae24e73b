//! HTTP status API
//!
//! Read-only JSON snapshots of devices and sessions plus a basic-auth
//! guarded terminate endpoint. The core never renders HTML; this surface
//! is JSON only.
//!
//! # Endpoints
//!
//! - `GET /healthz` - liveness probe
//! - `GET /readyz` - readiness probe with counts
//! - `GET /api/v1/devices` - registered devices
//! - `GET /api/v1/sessions` - active sessions
//! - `GET /api/v1/stats` - counts
//! - `DELETE /api/v1/sessions/{id}` - terminate a session (basic auth)

mod handlers;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{delete, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::constants::timeout;
use crate::registry::Registry;
use crate::session::Manager;

/// Shared state for the API handlers
pub struct ApiState {
    cfg: Arc<Config>,
    registry: Arc<Registry>,
    sessions: Arc<Manager>,
}

/// The HTTP status API server
pub struct Server {
    listener: TcpListener,
    router: Router,
}

impl Server {
    /// Bind the API port and build the router.
    pub async fn bind(
        cfg: Arc<Config>,
        registry: Arc<Registry>,
        sessions: Arc<Manager>,
    ) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", cfg.api_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API port {}", addr))?;

        info!("API server listening on {}", addr);

        let state = Arc::new(ApiState {
            cfg,
            registry,
            sessions,
        });

        Ok(Self {
            listener,
            router: build_router(state),
        })
    }

    /// Actual bound address, useful when the configured port is 0
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the shutdown token fires, then give in-flight requests
    /// a short grace period.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let graceful = shutdown.clone();
        let serve = async move {
            axum::serve(self.listener, self.router)
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
        };

        tokio::select! {
            res = serve => res.map_err(anyhow::Error::from),
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(timeout::API_SHUTDOWN_GRACE).await;
            } => {
                info!("API server shutdown grace elapsed");
                Ok(())
            }
        }
    }
}

fn build_router(state: Arc<ApiState>) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/api/v1/devices", get(handlers::list_devices))
        .route("/api/v1/sessions", get(handlers::list_sessions))
        .route("/api/v1/sessions/{id}", delete(handlers::terminate_session))
        .route("/api/v1/stats", get(handlers::stats))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Per-request logging is opt-in
    if state.cfg.debug_http {
        router = router.layer(TraceLayer::new_for_http());
    }

    router.with_state(state)
}
