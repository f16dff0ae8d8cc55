//! HTTP control plane (client role)
//!
//! A small authenticated surface that mutates the route store at runtime:
//!
//! - `GET  /api/health`    - liveness probe, unauthenticated
//! - `POST /api/ip/update` - repoint the listed routes at a new backend IP
//! - `POST /update`        - rewrite one route's bind address (applies on
//!   the next start; a running listener keeps its socket)
//!
//! Authentication is a shared bearer token from `.token` in the working
//! directory, generated on first use. Client and server carry the same
//! token out-of-band.

use crate::routes::{RouteError, RouteStore};
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Default token file name, relative to the working directory
pub const TOKEN_FILE: &str = ".token";

/// Generated token length
const TOKEN_LEN: usize = 32;

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to read token file: {0}")]
    TokenRead(#[source] std::io::Error),

    #[error("failed to write token file: {0}")]
    TokenWrite(#[source] std::io::Error),

    #[error("failed to bind control plane: {0}")]
    Bind(#[source] std::io::Error),

    #[error("control plane server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Read the shared bearer token, generating and persisting one (mode 0600)
/// if the file does not exist yet
pub fn read_token<P: AsRef<Path>>(path: P) -> Result<String, ControlError> {
    let path = path.as_ref();

    if !path.exists() {
        let token = generate_token();
        write_token_file(path, &token)?;
        info!(path = %path.display(), "Generated new bearer token");
        return Ok(token);
    }

    let token = std::fs::read_to_string(path).map_err(ControlError::TokenRead)?;
    Ok(token.trim_end().to_string())
}

fn write_token_file(path: &Path, token: &str) -> Result<(), ControlError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(ControlError::TokenWrite)?;
    file.write_all(token.as_bytes())
        .map_err(ControlError::TokenWrite)
}

fn generate_token() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    let mut bytes = [0u8; TOKEN_LEN];
    SystemRandom::new()
        .fill(&mut bytes)
        .expect("system RNG unavailable");

    bytes
        .iter()
        .map(|b| CHARSET[*b as usize % CHARSET.len()] as char)
        .collect()
}

/// Shared handler state
#[derive(Clone)]
struct AppState {
    store: Arc<RouteStore>,
    bearer: String,
}

/// Body of `POST /api/ip/update`
#[derive(Debug, Deserialize)]
struct IpUpdateRequest {
    endpoints: Vec<String>,
    #[serde(rename = "new-ip")]
    new_ip: String,
}

/// Body of `POST /update`
#[derive(Debug, Deserialize)]
struct BindUpdateRequest {
    route_id: String,
    ip: String,
    port: u16,
}

/// Build the control-plane router
pub fn router(store: Arc<RouteStore>, token: &str) -> Router {
    let state = AppState {
        store,
        bearer: format!("Bearer {}", token),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/ip/update", post(ip_update))
        .route("/update", post(bind_update))
        .with_state(state)
}

/// Bind and serve the control plane
pub async fn serve(store: Arc<RouteStore>, token: String, port: u16) -> Result<(), ControlError> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(ControlError::Bind)?;

    info!(addr = %addr, "Control plane listening");

    axum::serve(listener, router(store, &token))
        .await
        .map_err(ControlError::Serve)
}

fn authorized(headers: &HeaderMap, bearer: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == bearer)
        .unwrap_or(false)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn ip_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IpUpdateRequest>,
) -> impl IntoResponse {
    if !authorized(&headers, &state.bearer) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "unauthorized"})),
        );
    }

    let mut updated = 0usize;
    for route_id in &request.endpoints {
        match state.store.set_backend_ip(route_id, &request.new_ip) {
            Ok(()) => {
                updated += 1;
                info!(route_id = %route_id, new_ip = %request.new_ip, "Updated route backend IP");
            }
            Err(_) => {
                warn!(route_id = %route_id, "Route not found, skipping IP update");
            }
        }
    }

    if updated > 0 {
        if let Err(e) = state.store.persist() {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "message": format!("failed to save routes: {}", e),
                })),
            );
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": format!("updated {} routes", updated),
        })),
    )
}

async fn bind_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BindUpdateRequest>,
) -> impl IntoResponse {
    if !authorized(&headers, &state.bearer) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        );
    }

    match state
        .store
        .set_bind(&request.route_id, &request.ip, request.port)
    {
        Ok(()) => {}
        Err(RouteError::NotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "route not found"})),
            );
        }
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            );
        }
    }

    if state.store.persist().is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "failed to save routes"})),
        );
    }

    (StatusCode::OK, Json(json!({"success": true})))
}
