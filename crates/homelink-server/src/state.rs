//! Shared application state

use crate::connections::ConnectionRegistry;
use homelink_auth::{ClientRegistry, PairingSessionManager};
use homelink_core::protocol::{EntityUpdate, ServiceCall};
use homelink_core::Config;
use homelink_store::{ClientId, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Capacity of the entity-update fan-out channel. Slow consumers lag and
/// drop updates rather than backpressure the producer; missed events are
/// not replayed.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A service invocation accepted from an authenticated client, forwarded to
/// the upstream coordinator
#[derive(Debug, Clone)]
pub struct ServiceCommand {
    pub client_id: ClientId,
    pub call: ServiceCall,
}

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Durable store shared by pairing and the realtime channel
    pub store: Arc<Store>,
    /// PIN issuance and session sweep
    pub sessions: PairingSessionManager,
    /// Client identities and trust tokens
    pub registry: ClientRegistry,
    /// Live authenticated realtime connections
    pub connections: ConnectionRegistry,
    /// Entity state-change fan-out
    event_tx: broadcast::Sender<EntityUpdate>,
    /// Upstream service-call sink
    command_tx: mpsc::Sender<ServiceCommand>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<Store>, command_tx: mpsc::Sender<ServiceCommand>) -> Self {
        let sessions = PairingSessionManager::with_intervals(
            store.clone(),
            chrono::Duration::seconds(config.pin_ttl_secs),
            Duration::from_secs(config.sweep_interval_secs),
        );
        let registry = ClientRegistry::new(store.clone());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            store,
            sessions,
            registry,
            connections: ConnectionRegistry::new(),
            event_tx,
            command_tx,
        }
    }

    /// Push an entity state change to all authenticated connections.
    /// Best-effort: no subscribers is not an error.
    pub fn publish_entity_update(&self, update: EntityUpdate) {
        let _ = self.event_tx.send(update);
    }

    /// Subscribe to the entity-update fan-out
    pub fn subscribe_events(&self) -> broadcast::Receiver<EntityUpdate> {
        self.event_tx.subscribe()
    }

    /// Forward a service call upstream; false if the sink is gone
    pub async fn forward_service_call(&self, command: ServiceCommand) -> bool {
        self.command_tx.send(command).await.is_ok()
    }
}
