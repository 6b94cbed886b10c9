//! Active realtime connection registry
//!
//! The only in-process shared mutable state: a client_id-keyed map of live
//! authenticated connections. At most one connection per client_id; a new
//! registration displaces the prior handle so its task can be force-closed.
//! For horizontal scaling this registry would move into the store or a
//! shared broker.

use homelink_store::ClientId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Handle to a live connection's task, able to request its termination
#[derive(Debug)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    close_tx: mpsc::UnboundedSender<()>,
}

impl ConnectionHandle {
    pub fn new(conn_id: Uuid, close_tx: mpsc::UnboundedSender<()>) -> Self {
        Self { conn_id, close_tx }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Signal the owning task to terminate. The task may already be gone;
    /// a dead receiver is fine.
    pub fn force_close(&self) {
        let _ = self.close_tx.send(());
    }
}

/// Registry of authenticated connections keyed by client_id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<ClientId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `client_id`, returning the displaced handle
    /// if one was present. The caller is responsible for force-closing it.
    pub fn register(&self, client_id: ClientId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(client_id, handle)
    }

    /// Remove the registration for `client_id`, but only if it still belongs
    /// to `conn_id`. A force-closed connection unregistering late must not
    /// evict its replacement.
    pub fn unregister(&self, client_id: &ClientId, conn_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(client_id) {
            Some(handle) if handle.conn_id() == conn_id => {
                inner.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// The conn_id currently registered for `client_id`, if any
    pub fn lookup(&self, client_id: &ClientId) -> Option<Uuid> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(client_id).map(|h| h.conn_id())
    }

    /// Number of live authenticated connections
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(Uuid::new_v4(), tx), rx)
    }

    #[test]
    fn test_register_displaces_prior_connection() {
        let registry = ConnectionRegistry::new();
        let client = ClientId::new();

        let (first, mut first_rx) = handle();
        let (second, _second_rx) = handle();
        let second_conn = second.conn_id();

        assert!(registry.register(client, first).is_none());
        let displaced = registry.register(client, second).unwrap();
        displaced.force_close();

        // The displaced task received its close signal
        assert!(first_rx.try_recv().is_ok());
        // Only the most recent connection remains registered
        assert_eq!(registry.lookup(&client), Some(second_conn));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_requires_matching_conn_id() {
        let registry = ConnectionRegistry::new();
        let client = ClientId::new();

        let (first, _rx1) = handle();
        let first_conn = first.conn_id();
        registry.register(client, first);

        let (second, _rx2) = handle();
        let second_conn = second.conn_id();
        registry.register(client, second);

        // The stale connection cannot evict its replacement
        assert!(!registry.unregister(&client, first_conn));
        assert_eq!(registry.lookup(&client), Some(second_conn));

        assert!(registry.unregister(&client, second_conn));
        assert!(registry.is_empty());
    }
}
