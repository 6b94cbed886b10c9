//! Homelink Store - durable state for the pairing subsystem
//!
//! SQLite-backed CRUD for pairing sessions, paired clients, and the
//! append-only activity log. All mutations go through a single connection
//! guarded by an async mutex; callers block only their own operation.

pub mod model;
pub mod store;

pub use model::{
    ActivityLogEntry, Client, ClientId, ClientPatch, ClientSummary, DeviceType, NewClient,
    PairingSession,
};
pub use store::{Store, StoreError, StoreResult};
