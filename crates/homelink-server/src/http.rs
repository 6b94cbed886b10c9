//! HTTP request handlers
//!
//! Pairing endpoints are unauthenticated (trust is established by the PIN);
//! client-management endpoints require the admin bearer token.

use axum::{
    extract::{ConnectInfo, Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use homelink_auth::{AuthError, PairingRequest, PinIssued};
use homelink_store::{ActivityLogEntry, ClientId, ClientSummary};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::error;

use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Pairing API (no auth; the PIN is the trust anchor)
        .route("/pairing/pin", get(pairing_pin_handler))
        .route("/pairing/complete", post(pairing_complete_handler))
        // Realtime channel (authenticates in-band)
        .route("/ws", get(crate::websocket::ws_handler))
        // Client management (admin token)
        .route("/clients", get(list_clients_handler))
        .route("/clients/:id", delete(delete_client_handler))
        .route("/clients/:id/revoke", post(revoke_client_handler))
        .route("/activity", get(activity_handler))
        // Server info
        .route("/info", get(info_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Error payload wrapper mapping the auth taxonomy onto HTTP statuses
pub struct ApiError(AuthError);

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self.0 {
            AuthError::Validation(_) => {
                (StatusCode::BAD_REQUEST, "validation_error", self.0.to_string())
            }
            AuthError::Authentication(_) => {
                (StatusCode::UNAUTHORIZED, "authentication_error", self.0.to_string())
            }
            AuthError::Conflict(_) => (StatusCode::CONFLICT, "conflict", self.0.to_string()),
            AuthError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", self.0.to_string()),
            AuthError::Store(e) => {
                error!("Store operation failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "internal storage failure".to_string(),
                )
            }
        };
        (status, Json(json!({"error": code, "message": message}))).into_response()
    }
}

/// Admin gate: constant-time bearer-token check. A missing configured token
/// keeps the management surface closed.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(AuthError::Authentication("authentication required".to_string()).into());
    };
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));
    match supplied {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(()),
        _ => Err(AuthError::Authentication("invalid admin token".to_string()).into()),
    }
}

fn parse_client_id(raw: &str) -> Result<ClientId, ApiError> {
    ClientId::parse(raw)
        .map_err(|_| AuthError::Validation(format!("invalid client id: {}", raw)).into())
}

// ============================================================================
// Pairing
// ============================================================================

/// Issue a new pairing PIN
async fn pairing_pin_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<PinIssued>, ApiError> {
    let issued = state.sessions.generate_pin().await?;
    state
        .store
        .log_activity(None, "pin_issued", None, Some(&addr.ip().to_string()))
        .await
        .map_err(AuthError::from)?;
    Ok(Json(issued))
}

/// Response after successful pairing completion. The certificate appears
/// here and nowhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCompleted {
    pub client_id: ClientId,
    pub certificate: String,
    pub paired_at: DateTime<Utc>,
}

/// Complete pairing: PIN + device identity in, client credentials out
async fn pairing_complete_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<PairingRequest>,
) -> Result<Json<PairingCompleted>, ApiError> {
    let client = state
        .registry
        .complete_pairing(request, Some(&addr.ip().to_string()))
        .await?;
    Ok(Json(PairingCompleted {
        client_id: client.id,
        certificate: client.certificate,
        paired_at: client.paired_at,
    }))
}

// ============================================================================
// Client management
// ============================================================================

/// List all paired clients
async fn list_clients_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ClientSummary>>, ApiError> {
    require_admin(&state, &headers)?;
    let clients = state.registry.list().await?;
    Ok(Json(clients.iter().map(ClientSummary::from).collect()))
}

/// Hard-delete a client record
async fn delete_client_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let client_id = parse_client_id(&id)?;
    state
        .registry
        .remove(&client_id, Some(&addr.ip().to_string()))
        .await?;
    Ok(Json(json!({"deleted": true})))
}

/// Revoke a client's credentials without deleting its record
async fn revoke_client_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let client_id = parse_client_id(&id)?;
    state
        .registry
        .revoke(&client_id, Some(&addr.ip().to_string()))
        .await?;
    Ok(Json(json!({"revoked": true})))
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    #[serde(default = "default_activity_limit")]
    limit: usize,
}

fn default_activity_limit() -> usize {
    50
}

/// Recent audit-trail entries, newest first
async fn activity_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityLogEntry>>, ApiError> {
    require_admin(&state, &headers)?;
    let entries = state
        .store
        .recent_activity(query.limit)
        .await
        .map_err(AuthError::from)?;
    Ok(Json(entries))
}

// ============================================================================
// Server info
// ============================================================================

/// Server information response
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub version: String,
    pub paired_clients: usize,
    pub active_connections: usize,
    pub pin_ttl_secs: i64,
    pub heartbeat_interval_secs: u64,
}

/// Get server information
async fn info_handler(State(state): State<Arc<AppState>>) -> Result<Json<ServerInfo>, ApiError> {
    let paired_clients = state.store.client_count().await.map_err(AuthError::from)?;
    Ok(Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        paired_clients,
        active_connections: state.connections.len(),
        pin_ttl_secs: state.config.pin_ttl_secs,
        heartbeat_interval_secs: state.config.heartbeat_interval_secs,
    }))
}
