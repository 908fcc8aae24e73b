//! HTTP request handlers for the status API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::info;

use super::ApiState;
use crate::registry::DeviceInfo;
use crate::session::SessionInfo;

#[derive(Serialize)]
pub(crate) struct StatusBody {
    status: &'static str,
}

#[derive(Serialize)]
pub(crate) struct ReadyBody {
    status: &'static str,
    devices: usize,
    sessions: usize,
}

#[derive(Serialize)]
pub(crate) struct StatsBody {
    devices: usize,
    sessions: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

#[derive(Serialize)]
struct TerminatedBody {
    status: &'static str,
    id: String,
}

/// GET /healthz
pub async fn healthz() -> Json<StatusBody> {
    Json(StatusBody { status: "ok" })
}

/// GET /readyz
pub async fn readyz(State(state): State<Arc<ApiState>>) -> Json<ReadyBody> {
    Json(ReadyBody {
        status: "ready",
        devices: state.registry.count(),
        sessions: state.sessions.count(),
    })
}

/// GET /api/v1/devices
pub async fn list_devices(State(state): State<Arc<ApiState>>) -> Json<Vec<DeviceInfo>> {
    Json(state.registry.list_info())
}

/// GET /api/v1/sessions
pub async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list_info())
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<Arc<ApiState>>) -> Json<StatsBody> {
    Json(StatsBody {
        devices: state.registry.count(),
        sessions: state.sessions.count(),
    })
}

/// DELETE /api/v1/sessions/{id}
///
/// Requires basic auth with the configured web credentials. Termination
/// closes both of the session's transports; the bridge's caller performs
/// the actual session end.
pub async fn terminate_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Response {
    if !is_authorized(&headers, &state.cfg.web_user, &state.cfg.web_pass) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"rfc2217-proxy\"")],
            Json(ErrorBody {
                error: "unauthorized",
            }),
        )
            .into_response();
    }

    if state.sessions.terminate(&id) {
        info!("session {} terminated via API", id);
        (
            StatusCode::OK,
            Json(TerminatedBody {
                status: "terminated",
                id,
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "session not found",
            }),
        )
            .into_response()
    }
}

/// Check basic auth credentials in constant time.
fn is_authorized(headers: &axum::http::HeaderMap, user: &str, pass: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((got_user, got_pass)) = decoded.split_once(':') else {
        return false;
    };

    bool::from(
        got_user.as_bytes().ct_eq(user.as_bytes()) & got_pass.as_bytes().ct_eq(pass.as_bytes()),
    )
}
