//! Realtime channel wire frames
//!
//! Frames are JSON objects of the shape `{"type": ..., "payload": ...}`;
//! frames without a body omit the payload key entirely.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A state change pushed to authenticated connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// Entity identifier (e.g., "light.kitchen")
    pub entity_id: String,
    /// New state as reported upstream
    pub state: Value,
}

/// A service invocation forwarded to the upstream coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

/// Frames exchanged over the realtime channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    /// Sent by the server immediately after the socket opens
    Connected,
    /// Client credential presentation
    Auth {
        client_id: Uuid,
        certificate: String,
    },
    /// Acknowledges a successful auth frame
    AuthOk,
    /// Liveness probe (either direction)
    Ping,
    /// Liveness response
    Pong,
    /// Request entity updates, optionally narrowed to specific entities
    SubscribeEntities {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_ids: Option<Vec<String>>,
    },
    /// Acknowledges a subscription request
    Subscribed,
    /// Invoke a service upstream
    CallService(ServiceCall),
    /// Outcome of a call_service frame
    ServiceCallResult {
        success: bool,
        #[serde(default)]
        result: Option<Value>,
    },
    /// State change fan-out
    EntityUpdate(EntityUpdate),
    /// Error report; on auth failure the connection closes right after
    Error { error: String },
}
