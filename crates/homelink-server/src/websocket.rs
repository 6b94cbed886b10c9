//! Realtime channel: per-connection state machine and socket wiring
//!
//! A connection starts unauthenticated, presents `auth{client_id,
//! certificate}` in-band, and only then receives entity updates or may issue
//! privileged frames. Liveness is enforced with a ping/pong heartbeat; a
//! missed pong terminates the connection without a graceful close.
//!
//! The state machine lives in [`WsSession`], separate from socket I/O, so it
//! is driven directly in tests.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use homelink_core::protocol::{EntityUpdate, Frame};
use homelink_store::ClientId;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connections::ConnectionHandle;
use crate::state::{AppState, ServiceCommand};

/// WebSocket upgrade handler for the realtime channel
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Connection lifecycle phases. `Closed` is the task exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connected,
    Authenticated(ClientId),
}

/// What a processed frame asks the transport to do
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub replies: Vec<Frame>,
    pub close: bool,
}

impl FrameOutcome {
    fn reply(frame: Frame) -> Self {
        Self {
            replies: vec![frame],
            close: false,
        }
    }

    fn close_with(frame: Frame) -> Self {
        Self {
            replies: vec![frame],
            close: true,
        }
    }

    fn silent() -> Self {
        Self::default()
    }
}

/// Per-connection state machine, independent of the socket
pub struct WsSession {
    state: Arc<AppState>,
    conn_id: Uuid,
    close_tx: mpsc::UnboundedSender<()>,
    ip: Option<String>,
    phase: Phase,
    /// None until subscribed with a filter; an empty filter means everything
    filter: Option<HashSet<String>>,
    awaiting_pong: bool,
}

impl WsSession {
    pub fn new(state: Arc<AppState>, close_tx: mpsc::UnboundedSender<()>, ip: Option<String>) -> Self {
        Self {
            state,
            conn_id: Uuid::new_v4(),
            close_tx,
            ip,
            phase: Phase::Connected,
            filter: None,
            awaiting_pong: false,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// The authenticated client, if the handshake has completed
    pub fn client_id(&self) -> Option<ClientId> {
        match self.phase {
            Phase::Authenticated(id) => Some(id),
            Phase::Connected => None,
        }
    }

    /// Process one inbound frame
    pub async fn handle_frame(&mut self, frame: Frame) -> FrameOutcome {
        match frame {
            Frame::Auth {
                client_id,
                certificate,
            } => self.handle_auth(ClientId(client_id), &certificate).await,
            Frame::Ping => FrameOutcome::reply(Frame::Pong),
            Frame::Pong => self.handle_pong().await,
            Frame::SubscribeEntities { entity_ids } => self.handle_subscribe(entity_ids).await,
            Frame::CallService(call) => self.handle_call_service(call).await,
            other => {
                debug!("Unexpected frame on connection {}: {:?}", self.conn_id, other);
                FrameOutcome::reply(Frame::Error {
                    error: "unexpected frame".to_string(),
                })
            }
        }
    }

    async fn handle_auth(&mut self, client_id: ClientId, certificate: &str) -> FrameOutcome {
        if matches!(self.phase, Phase::Authenticated(_)) {
            return FrameOutcome::reply(Frame::Error {
                error: "already authenticated".to_string(),
            });
        }

        let verified = match self
            .state
            .registry
            .verify_certificate(&client_id, certificate)
            .await
        {
            Ok(verified) => verified,
            Err(e) => {
                warn!("Certificate verification errored: {}", e);
                false
            }
        };
        if !verified {
            warn!("Authentication failed on connection {}", self.conn_id);
            return FrameOutcome::close_with(Frame::Error {
                error: "authentication failed".to_string(),
            });
        }

        if let Err(e) = self.state.registry.update_activity(&client_id).await {
            warn!("Failed to record activity for {}: {}", client_id, e);
            return FrameOutcome::close_with(Frame::Error {
                error: "authentication failed".to_string(),
            });
        }

        // One live connection per client: displace and force-close any prior
        let handle = ConnectionHandle::new(self.conn_id, self.close_tx.clone());
        if let Some(prior) = self.state.connections.register(client_id, handle) {
            debug!("Displacing prior connection for client {}", client_id);
            prior.force_close();
        }
        self.phase = Phase::Authenticated(client_id);

        if let Err(e) = self
            .state
            .store
            .log_activity(Some(client_id), "client_connected", None, self.ip.as_deref())
            .await
        {
            warn!("Failed to log connection event: {}", e);
        }

        info!("Client {} authenticated on connection {}", client_id, self.conn_id);
        FrameOutcome::reply(Frame::AuthOk)
    }

    async fn handle_pong(&mut self) -> FrameOutcome {
        self.awaiting_pong = false;
        if let Phase::Authenticated(client_id) = self.phase {
            if let Err(e) = self.state.registry.update_activity(&client_id).await {
                warn!("Heartbeat activity update failed for {}: {}", client_id, e);
            }
        }
        FrameOutcome::silent()
    }

    async fn handle_subscribe(&mut self, entity_ids: Option<Vec<String>>) -> FrameOutcome {
        match self.privileged_gate().await {
            Ok(_) => {
                self.filter = entity_ids.map(|ids| ids.into_iter().collect());
                FrameOutcome::reply(Frame::Subscribed)
            }
            Err(outcome) => outcome,
        }
    }

    async fn handle_call_service(
        &mut self,
        call: homelink_core::protocol::ServiceCall,
    ) -> FrameOutcome {
        let client_id = match self.privileged_gate().await {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let success = self
            .state
            .forward_service_call(ServiceCommand { client_id, call })
            .await;
        if !success {
            warn!("Service-call sink is gone; rejecting call from {}", client_id);
        }
        FrameOutcome::reply(Frame::ServiceCallResult {
            success,
            result: None,
        })
    }

    /// Gate for privileged frames: requires an authenticated phase AND a
    /// still-active client. Re-checking is_active on every privileged action
    /// bounds the exposure window after revocation.
    async fn privileged_gate(&mut self) -> Result<ClientId, FrameOutcome> {
        let client_id = match self.phase {
            Phase::Authenticated(id) => id,
            Phase::Connected => {
                return Err(FrameOutcome::reply(Frame::Error {
                    error: "Authentication required".to_string(),
                }))
            }
        };
        match self.state.registry.get(&client_id).await {
            Ok(Some(client)) if client.is_active => Ok(client_id),
            Ok(_) => {
                info!("Closing connection for revoked client {}", client_id);
                Err(FrameOutcome::close_with(Frame::Error {
                    error: "client revoked".to_string(),
                }))
            }
            Err(e) => {
                warn!("Client lookup failed for {}: {}", client_id, e);
                Err(FrameOutcome::close_with(Frame::Error {
                    error: "internal error".to_string(),
                }))
            }
        }
    }

    /// Heartbeat timer fired. Returns the ping to send, or None when the
    /// previous ping went unanswered and the connection must be terminated.
    pub fn heartbeat_tick(&mut self) -> Option<Frame> {
        if self.awaiting_pong {
            return None;
        }
        self.awaiting_pong = true;
        Some(Frame::Ping)
    }

    /// Whether this connection should receive an entity update
    pub fn wants_event(&self, update: &EntityUpdate) -> bool {
        if self.client_id().is_none() {
            return false;
        }
        match &self.filter {
            None => true,
            Some(ids) => ids.contains(&update.entity_id),
        }
    }

    /// Tear down registry state on disconnect. Safe to call for connections
    /// that never authenticated or were displaced.
    pub fn finish(&self) {
        if let Phase::Authenticated(client_id) = self.phase {
            if self.state.connections.unregister(&client_id, self.conn_id) {
                debug!("Client {} disconnected", client_id);
            }
        }
    }
}

/// Drive a WebSocket connection through the session state machine
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    let mut session = WsSession::new(state.clone(), close_tx, Some(addr.ip().to_string()));

    debug!("Connection {} opened from {}", session.conn_id(), addr);

    if send_frame(&mut sender, &Frame::Connected).await.is_err() {
        session.finish();
        return;
    }

    let mut events = state.subscribe_events();
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(state.config.heartbeat_interval_secs));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // consume the interval's immediate first tick
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!("Malformed frame: {}", e);
                                let reply = Frame::Error { error: "malformed frame".to_string() };
                                if send_frame(&mut sender, &reply).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        let outcome = session.handle_frame(frame).await;
                        let mut send_failed = false;
                        for reply in &outcome.replies {
                            if send_frame(&mut sender, reply).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if outcome.close || send_failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                match session.heartbeat_tick() {
                    Some(ping) => {
                        if send_frame(&mut sender, &ping).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // missed pong: terminate without a graceful close
                        warn!("Connection {} missed heartbeat, terminating", session.conn_id());
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(update) => {
                        if session.wants_event(&update) {
                            let frame = Frame::EntityUpdate(update);
                            if send_frame(&mut sender, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Connection {} lagged {} entity update(s)", session.conn_id(), n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = close_rx.recv() => {
                debug!("Connection {} displaced by a newer connection", session.conn_id());
                break;
            }
        }
    }

    session.finish();
    debug!("Connection {} closed", session.conn_id());
}

async fn send_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    frame: &Frame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sender.send(Message::Text(json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use homelink_auth::PairingRequest;
    use homelink_core::Config;
    use homelink_store::{Client, Store};
    use serde_json::json;

    async fn test_state() -> (Arc<AppState>, mpsc::Receiver<ServiceCommand>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (command_tx, command_rx) = mpsc::channel(8);
        let state = Arc::new(AppState::new(Config::default(), store, command_tx));
        (state, command_rx)
    }

    async fn pair_client(state: &AppState, public_key: &str) -> Client {
        state
            .store
            .create_pairing_session("482913", chrono::Utc::now() + chrono::Duration::seconds(300))
            .await
            .unwrap();
        state
            .registry
            .complete_pairing(
                PairingRequest {
                    pin: "482913".to_string(),
                    device_name: "Kitchen Tablet".to_string(),
                    device_type: "tablet".to_string(),
                    public_key: public_key.to_string(),
                    metadata: None,
                },
                None,
            )
            .await
            .unwrap()
    }

    fn session(state: &Arc<AppState>) -> (WsSession, mpsc::UnboundedReceiver<()>) {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        (
            WsSession::new(state.clone(), close_tx, Some("10.0.0.5".to_string())),
            close_rx,
        )
    }

    fn auth_frame(client: &Client) -> Frame {
        Frame::Auth {
            client_id: client.id.0,
            certificate: client.certificate.clone(),
        }
    }

    #[tokio::test]
    async fn test_privileged_frame_before_auth_is_rejected() {
        let (state, mut command_rx) = test_state().await;
        let (mut session, _close_rx) = session(&state);

        for frame in [
            Frame::SubscribeEntities { entity_ids: None },
            Frame::CallService(homelink_core::protocol::ServiceCall {
                domain: "light".to_string(),
                service: "turn_on".to_string(),
                service_data: None,
                target: None,
            }),
        ] {
            let outcome = session.handle_frame(frame).await;
            assert!(!outcome.close, "connection must stay open");
            assert!(matches!(
                &outcome.replies[..],
                [Frame::Error { error }] if error.as_str() == "Authentication required"
            ));
        }
        // The requested effects never happened
        assert!(command_rx.try_recv().is_err());
        assert!(state.connections.is_empty());
    }

    #[tokio::test]
    async fn test_auth_success_registers_connection() {
        let (state, _command_rx) = test_state().await;
        let client = pair_client(&state, "pk_ws").await;
        let (mut session, _close_rx) = session(&state);

        let outcome = session.handle_frame(auth_frame(&client)).await;
        assert!(!outcome.close);
        assert!(matches!(&outcome.replies[..], [Frame::AuthOk]));
        assert_eq!(session.client_id(), Some(client.id));
        assert_eq!(state.connections.lookup(&client.id), Some(session.conn_id()));

        let stored = state.store.get_client(&client.id).await.unwrap().unwrap();
        assert!(stored.last_seen >= client.last_seen);
    }

    #[tokio::test]
    async fn test_auth_failure_closes_connection() {
        let (state, _command_rx) = test_state().await;
        let client = pair_client(&state, "pk_bad").await;
        let (mut session, _close_rx) = session(&state);

        let outcome = session
            .handle_frame(Frame::Auth {
                client_id: client.id.0,
                certificate: "0".repeat(64),
            })
            .await;
        assert!(outcome.close);
        assert!(matches!(&outcome.replies[..], [Frame::Error { .. }]));
        assert!(state.connections.is_empty());
        assert!(session.client_id().is_none());
    }

    #[tokio::test]
    async fn test_second_connection_displaces_first() {
        let (state, _command_rx) = test_state().await;
        let client = pair_client(&state, "pk_dup").await;

        let (mut first, mut first_close_rx) = session(&state);
        let (mut second, _second_close_rx) = session(&state);

        first.handle_frame(auth_frame(&client)).await;
        second.handle_frame(auth_frame(&client)).await;

        // The prior connection got its close signal; the registry retains
        // only the most recent one
        assert!(first_close_rx.try_recv().is_ok());
        assert_eq!(state.connections.lookup(&client.id), Some(second.conn_id()));

        // The displaced connection's teardown must not evict the newer one
        first.finish();
        assert_eq!(state.connections.lookup(&client.id), Some(second.conn_id()));

        second.finish();
        assert!(state.connections.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_missed_pong_terminates() {
        let (state, _command_rx) = test_state().await;
        let (mut session, _close_rx) = session(&state);

        assert!(matches!(session.heartbeat_tick(), Some(Frame::Ping)));
        // No pong arrived before the next tick
        assert!(session.heartbeat_tick().is_none());
    }

    #[tokio::test]
    async fn test_pong_resets_heartbeat_and_updates_activity() {
        let (state, _command_rx) = test_state().await;
        let client = pair_client(&state, "pk_hb").await;
        let (mut session, _close_rx) = session(&state);
        session.handle_frame(auth_frame(&client)).await;

        assert!(session.heartbeat_tick().is_some());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let outcome = session.handle_frame(Frame::Pong).await;
        assert!(outcome.replies.is_empty());
        assert!(!outcome.close);
        // Pong re-arms the heartbeat
        assert!(session.heartbeat_tick().is_some());

        let stored = state.store.get_client(&client.id).await.unwrap().unwrap();
        assert!(stored.last_seen > client.last_seen);
    }

    #[tokio::test]
    async fn test_ping_gets_pong_without_auth() {
        let (state, _command_rx) = test_state().await;
        let (mut session, _close_rx) = session(&state);
        let outcome = session.handle_frame(Frame::Ping).await;
        assert!(matches!(&outcome.replies[..], [Frame::Pong]));
    }

    #[tokio::test]
    async fn test_subscription_filter() {
        let (state, _command_rx) = test_state().await;
        let client = pair_client(&state, "pk_sub").await;
        let (mut session, _close_rx) = session(&state);

        let kitchen = EntityUpdate {
            entity_id: "light.kitchen".to_string(),
            state: json!({"on": true}),
        };

        // Unauthenticated connections never receive events
        assert!(!session.wants_event(&kitchen));

        session.handle_frame(auth_frame(&client)).await;
        // Authenticated with no filter: everything is delivered
        assert!(session.wants_event(&kitchen));

        let outcome = session
            .handle_frame(Frame::SubscribeEntities {
                entity_ids: Some(vec!["light.hallway".to_string()]),
            })
            .await;
        assert!(matches!(&outcome.replies[..], [Frame::Subscribed]));
        assert!(!session.wants_event(&kitchen));
        assert!(session.wants_event(&EntityUpdate {
            entity_id: "light.hallway".to_string(),
            state: json!({"on": false}),
        }));
    }

    #[tokio::test]
    async fn test_call_service_forwards_upstream() {
        let (state, mut command_rx) = test_state().await;
        let client = pair_client(&state, "pk_call").await;
        let (mut session, _close_rx) = session(&state);
        session.handle_frame(auth_frame(&client)).await;

        let outcome = session
            .handle_frame(Frame::CallService(homelink_core::protocol::ServiceCall {
                domain: "light".to_string(),
                service: "turn_on".to_string(),
                service_data: Some(json!({"brightness": 200})),
                target: Some(json!({"entity_id": "light.kitchen"})),
            }))
            .await;
        assert!(matches!(
            &outcome.replies[..],
            [Frame::ServiceCallResult { success: true, .. }]
        ));

        let command = command_rx.try_recv().unwrap();
        assert_eq!(command.client_id, client.id);
        assert_eq!(command.call.domain, "light");
        assert_eq!(command.call.service, "turn_on");
    }

    #[tokio::test]
    async fn test_revoked_client_is_cut_off_on_next_privileged_frame() {
        let (state, _command_rx) = test_state().await;
        let client = pair_client(&state, "pk_rev").await;
        let (mut session, _close_rx) = session(&state);
        session.handle_frame(auth_frame(&client)).await;

        state.registry.revoke(&client.id, None).await.unwrap();

        let outcome = session
            .handle_frame(Frame::SubscribeEntities { entity_ids: None })
            .await;
        assert!(outcome.close);
        assert!(matches!(&outcome.replies[..], [Frame::Error { .. }]));
    }

    #[tokio::test]
    async fn test_server_only_frame_from_client_is_an_error() {
        let (state, _command_rx) = test_state().await;
        let (mut session, _close_rx) = session(&state);
        let outcome = session.handle_frame(Frame::AuthOk).await;
        assert!(!outcome.close);
        assert!(matches!(&outcome.replies[..], [Frame::Error { .. }]));
    }
}
