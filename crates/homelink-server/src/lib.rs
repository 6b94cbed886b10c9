//! Homelink Server - REST boundary and authenticated realtime channel
//!
//! The HTTP surface exposes pairing and client management; the WebSocket
//! endpoint carries the realtime channel, which authenticates in-band with a
//! client id and certificate before any privileged frame is honored.

pub mod connections;
pub mod http;
pub mod state;
pub mod websocket;

pub use connections::{ConnectionHandle, ConnectionRegistry};
pub use http::create_router;
pub use state::{AppState, ServiceCommand};
