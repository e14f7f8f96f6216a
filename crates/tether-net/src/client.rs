//! Connection lifecycle on top of a [`WebSocketEngine`].
//!
//! The client runs in a dedicated tokio task. External code drives it through
//! a command channel and observes it through a `watch` of [`ConnectionState`]
//! plus an ordered stream of decoded [`ServerEvent`]s. Reconnect policy lives
//! here; the engine underneath only reports what happened.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_shared::protocol::{decode_event, ServerEvent};
use tether_shared::{ApiError, ProtocolError};

use crate::engine::{create_engine, EngineConfig, EngineEvent, WebSocketEngine};
use crate::error::EngineError;
use crate::reconnect::ReconnectionStrategy;

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

/// Why the connection is being torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectionSource {
    UserInitiated,
    SystemInitiated,
    /// The server sent an error envelope and is about to close.
    ServerInitiated(Option<ApiError>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebSocketError {
    #[error("{0}")]
    Engine(EngineError),

    #[error("{0}")]
    Server(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected { error: Option<WebSocketError> },
    Connecting,
    /// Transport is open; waiting for the server's first health check.
    WaitingForConnectionId,
    Connected { connection_id: String },
    Disconnecting { source: DisconnectionSource },
    WaitingForReconnect { error: Option<WebSocketError> },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// Connected, or on the way there.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::WaitingForConnectionId
                | ConnectionState::Connected { .. }
        )
    }

    pub fn connection_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Connected { connection_id } => Some(connection_id),
            _ => None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected { error: None }
    }
}

/// Builds an engine for an endpoint, wired to the given event sender.
pub type EngineFactory = Arc<
    dyn Fn(&str, mpsc::UnboundedSender<EngineEvent>) -> Result<Box<dyn WebSocketEngine>, EngineError>
        + Send
        + Sync,
>;

/// Factory producing real websocket engines.
pub fn default_engine_factory(config: EngineConfig) -> EngineFactory {
    Arc::new(move |url, events| create_engine(url, &config, events))
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ClientCommand {
    Connect,
    Disconnect(DisconnectionSource),
    SetEndpoint(String),
    Shutdown,
}

/// Cheap, cloneable handle to the websocket client task.
#[derive(Clone)]
pub struct WebSocketClient {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl WebSocketClient {
    /// Connect, unless already connecting or connected. Cancels a pending
    /// reconnect and connects immediately.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Connect);
    }

    pub fn disconnect(&self, source: DisconnectionSource) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect(source));
    }

    /// Endpoint used by the next `connect()`. A different URL gets a fresh engine.
    pub fn set_endpoint(&self, url: impl Into<String>) {
        let _ = self.cmd_tx.send(ClientCommand::SetEndpoint(url.into()));
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the client task, closing any open connection.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Shutdown);
    }
}

/// Spawn the websocket client in a background tokio task.
///
/// Returns the handle and the ordered stream of decoded server events.
/// Health checks are consumed by the client and not forwarded.
pub fn spawn_websocket_client(
    endpoint: Option<String>,
    strategy: ReconnectionStrategy,
    factory: EngineFactory,
) -> (WebSocketClient, mpsc::UnboundedReceiver<ServerEvent>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
    let (state_tx, state_rx) = watch::channel(ConnectionState::default());
    let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut task = ClientTask {
        endpoint,
        factory,
        engine: None,
        engine_rx: None,
        strategy,
        reconnect_at: None,
        state_tx,
        events_tx,
    };

    tokio::spawn(async move {
        loop {
            let reconnect_at = task.reconnect_at;
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::Connect) => task.connect(),
                        Some(ClientCommand::Disconnect(source)) => task.disconnect(source),
                        Some(ClientCommand::SetEndpoint(url)) => {
                            debug!(url = %url, "Websocket endpoint updated");
                            task.endpoint = Some(url);
                        }
                        Some(ClientCommand::Shutdown) | None => {
                            info!("Websocket client shutdown requested");
                            task.disconnect(DisconnectionSource::UserInitiated);
                            break;
                        }
                    }
                }

                event = next_engine_event(&mut task.engine_rx) => {
                    match event {
                        Some(event) => task.handle_engine_event(event),
                        None => task.engine_rx = None,
                    }
                }

                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    task.reconnect_at = None;
                    debug!("Reconnect timer fired");
                    task.connect();
                }
            }
        }

        info!("Websocket client task terminated");
    });

    (WebSocketClient { cmd_tx, state_rx }, events_rx)
}

async fn next_engine_event(
    rx: &mut Option<mpsc::UnboundedReceiver<EngineEvent>>,
) -> Option<EngineEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

struct ClientTask {
    endpoint: Option<String>,
    factory: EngineFactory,
    engine: Option<Box<dyn WebSocketEngine>>,
    engine_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    strategy: ReconnectionStrategy,
    reconnect_at: Option<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ClientTask {
    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&mut self, state: ConnectionState) {
        info!(state = ?state, "Websocket connection state changed");
        if state.is_connected() {
            self.strategy.successfully_connected();
        }
        self.state_tx.send_replace(state);
    }

    fn connect(&mut self) {
        if self.state().is_active() {
            debug!("Connect ignored, already connecting or connected");
            return;
        }
        let Some(url) = self.endpoint.clone() else {
            warn!("Connect requested without an endpoint");
            return;
        };

        let reuse = self.engine.as_ref().is_some_and(|e| e.url() == url);
        if !reuse {
            let (tx, rx) = mpsc::unbounded_channel();
            match (self.factory)(&url, tx) {
                Ok(engine) => {
                    self.engine = Some(engine);
                    self.engine_rx = Some(rx);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to create websocket engine");
                    self.set_state(ConnectionState::Disconnected {
                        error: Some(WebSocketError::Engine(e)),
                    });
                    return;
                }
            }
        }

        self.reconnect_at = None;
        if let Some(engine) = self.engine.as_ref() {
            engine.connect();
        }
        self.set_state(ConnectionState::Connecting);
    }

    fn disconnect(&mut self, source: DisconnectionSource) {
        self.reconnect_at = None;

        let idle = matches!(
            self.state(),
            ConnectionState::Disconnected { .. } | ConnectionState::WaitingForReconnect { .. }
        );
        if idle || self.engine.is_none() {
            if !matches!(self.state(), ConnectionState::Disconnected { error: None }) {
                self.set_state(ConnectionState::Disconnected { error: None });
            }
            return;
        }

        self.set_state(ConnectionState::Disconnecting { source });
        if let Some(engine) = self.engine.as_ref() {
            engine.disconnect();
        }

        // The engine reports synchronously; settle before the next command.
        while let Some(event) = self.engine_rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.handle_engine_event(event);
        }
        if matches!(self.state(), ConnectionState::Disconnecting { .. }) {
            self.set_state(ConnectionState::Disconnected { error: None });
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connected => {
                self.set_state(ConnectionState::WaitingForConnectionId);
            }
            EngineEvent::Message(text) => self.handle_message(&text),
            EngineEvent::Pong => debug!("Pong received"),
            EngineEvent::Disconnected(error) => self.handle_disconnected(error),
        }
    }

    fn handle_message(&mut self, text: &str) {
        match decode_event(text) {
            Ok(ServerEvent::HealthCheck { connection_id }) => {
                if !self.state().is_connected() {
                    self.set_state(ConnectionState::Connected { connection_id });
                }
            }
            Ok(event) => {
                debug!(kind = event.kind(), "Event received");
                let _ = self.events_tx.send(event);
            }
            Err(ProtocolError::UnsupportedType(kind)) => {
                info!(kind = %kind, "Skipping unsupported event type");
            }
            Err(ProtocolError::Server(api)) => {
                warn!(code = api.code, message = %api.message, "Server sent an error");
                self.disconnect(DisconnectionSource::ServerInitiated(Some(api)));
            }
            Err(e) => {
                warn!(error = %e, "Failed to decode event");
            }
        }
    }

    fn handle_disconnected(&mut self, engine_error: Option<EngineError>) {
        let state = self.state();
        let should_reconnect = !matches!(
            state,
            ConnectionState::Disconnecting {
                source: DisconnectionSource::UserInitiated
            }
        );

        let error = match state {
            ConnectionState::Disconnecting {
                source: DisconnectionSource::ServerInitiated(Some(api)),
            } => Some(WebSocketError::Server(api)),
            _ => engine_error.map(WebSocketError::Engine),
        };

        if matches!(error, Some(WebSocketError::Engine(EngineError::PongTimeout))) {
            info!("No pong received, connection deemed dead");
        }

        if should_reconnect {
            if let Some(delay) = self.strategy.next_delay(error.as_ref()) {
                debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::WaitingForReconnect { error });
                return;
            }
        }
        self.set_state(ConnectionState::Disconnected { error });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct MockState {
        url: String,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        events: mpsc::UnboundedSender<EngineEvent>,
    }

    impl MockState {
        fn simulate(&self, event: EngineEvent) {
            self.events.send(event).unwrap();
        }
    }

    struct MockEngine(Arc<MockState>);

    impl WebSocketEngine for MockEngine {
        fn url(&self) -> &str {
            &self.0.url
        }

        fn connect(&self) {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnect(&self) {
            self.0.disconnects.fetch_add(1, Ordering::SeqCst);
            let _ = self.0.events.send(EngineEvent::Disconnected(None));
        }

        fn send_ping(&self) {}
    }

    #[derive(Default)]
    struct EngineLog {
        engines: Mutex<Vec<Arc<MockState>>>,
    }

    impl EngineLog {
        fn factory(self: &Arc<Self>) -> EngineFactory {
            let engines = self.clone();
            Arc::new(move |url, events| {
                let state = Arc::new(MockState {
                    url: url.to_string(),
                    connects: AtomicUsize::new(0),
                    disconnects: AtomicUsize::new(0),
                    events,
                });
                engines.engines.lock().unwrap().push(state.clone());
                Ok(Box::new(MockEngine(state)) as Box<dyn WebSocketEngine>)
            })
        }

        fn engine(&self, idx: usize) -> Arc<MockState> {
            self.engines.lock().unwrap()[idx].clone()
        }

        fn count(&self) -> usize {
            self.engines.lock().unwrap().len()
        }
    }

    fn spawn(policy: RetryPolicy) -> (WebSocketClient, mpsc::UnboundedReceiver<ServerEvent>, Arc<EngineLog>) {
        let engines = Arc::new(EngineLog::default());
        let (client, events) = spawn_websocket_client(
            Some("ws://chat.test/connect".into()),
            ReconnectionStrategy::new(policy),
            engines.factory(),
        );
        (client, events, engines)
    }

    async fn wait_for(client: &WebSocketClient, pred: impl FnMut(&ConnectionState) -> bool) {
        let mut rx = client.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("client task gone");
    }

    const HEALTH_CHECK: &str = r#"{"type":"health.check","connection_id":"conn-1"}"#;

    async fn connected_client(
        policy: RetryPolicy,
    ) -> (WebSocketClient, mpsc::UnboundedReceiver<ServerEvent>, Arc<EngineLog>) {
        let (client, events, engines) = spawn(policy);
        client.connect();
        wait_for(&client, |s| *s == ConnectionState::Connecting).await;

        let engine = engines.engine(0);
        engine.simulate(EngineEvent::Connected);
        wait_for(&client, |s| *s == ConnectionState::WaitingForConnectionId).await;
        engine.simulate(EngineEvent::Message(HEALTH_CHECK.into()));
        wait_for(&client, ConnectionState::is_connected).await;
        (client, events, engines)
    }

    #[tokio::test]
    async fn test_connect_flow_and_idempotent_connect() {
        let (client, _events, engines) = connected_client(RetryPolicy::default()).await;
        assert_eq!(client.connection_state().connection_id(), Some("conn-1"));

        client.connect();
        client.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(engines.count(), 1);
        assert_eq!(engines.engine(0).connects.load(Ordering::SeqCst), 1);
        assert!(client.connection_state().is_connected());
    }

    #[tokio::test]
    async fn test_user_disconnect_does_not_reconnect() {
        let (client, _events, engines) = connected_client(RetryPolicy::new(5, 10)).await;

        client.disconnect(DisconnectionSource::UserInitiated);
        wait_for(&client, |s| *s == ConnectionState::Disconnected { error: None }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let engine = engines.engine(0);
        assert_eq!(engine.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(engine.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            client.connection_state(),
            ConnectionState::Disconnected { error: None }
        );
    }

    #[tokio::test]
    async fn test_system_disconnect_reconnects() {
        let (client, _events, engines) = connected_client(RetryPolicy::new(200, 200)).await;
        let engine = engines.engine(0);

        client.disconnect(DisconnectionSource::SystemInitiated);
        wait_for(&client, |s| {
            matches!(s, ConnectionState::WaitingForReconnect { error: None })
        })
        .await;
        wait_for(&client, |s| *s == ConnectionState::Connecting).await;

        assert_eq!(engine.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(engine.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_schedules_reconnect() {
        let (client, _events, engines) = connected_client(RetryPolicy::new(20, 100)).await;
        let engine = engines.engine(0);

        engine.simulate(EngineEvent::Disconnected(Some(EngineError::PongTimeout)));
        wait_for(&client, |s| {
            *s == ConnectionState::WaitingForReconnect {
                error: Some(WebSocketError::Engine(EngineError::PongTimeout)),
            }
        })
        .await;

        wait_for(&client, |s| *s == ConnectionState::Connecting).await;
        assert_eq!(engine.connects.load(Ordering::SeqCst), 2);
        assert_eq!(engines.count(), 1, "same endpoint reuses the engine");
    }

    #[tokio::test]
    async fn test_connect_while_waiting_for_reconnect_connects_immediately() {
        let (client, _events, engines) = connected_client(RetryPolicy::new(60_000, 60_000)).await;
        let engine = engines.engine(0);

        engine.simulate(EngineEvent::Disconnected(Some(EngineError::Transport(
            "reset".into(),
        ))));
        wait_for(&client, |s| {
            matches!(s, ConnectionState::WaitingForReconnect { .. })
        })
        .await;

        client.connect();
        wait_for(&client, |s| *s == ConnectionState::Connecting).await;
        assert_eq!(engine.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_while_waiting_for_reconnect_cancels_timer() {
        let (client, _events, engines) = connected_client(RetryPolicy::new(30, 30)).await;
        let engine = engines.engine(0);

        engine.simulate(EngineEvent::Disconnected(Some(EngineError::PongTimeout)));
        wait_for(&client, |s| {
            matches!(s, ConnectionState::WaitingForReconnect { .. })
        })
        .await;

        client.disconnect(DisconnectionSource::UserInitiated);
        wait_for(&client, |s| *s == ConnectionState::Disconnected { error: None }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_error_envelope_disconnects_for_good() {
        let (client, _events, engines) = connected_client(RetryPolicy::new(5, 10)).await;
        let engine = engines.engine(0);

        engine.simulate(EngineEvent::Message(
            r#"{"error":{"code":40,"message":"token expired","StatusCode":401}}"#.into(),
        ));

        let mut expected = ApiError::new(40, "token expired");
        expected.status = Some(401);
        wait_for(&client, |s| {
            *s == ConnectionState::Disconnected {
                error: Some(WebSocketError::Server(expected.clone())),
            }
        })
        .await;
        assert_eq!(engine.disconnects.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_forwarded_in_order_and_unsupported_skipped() {
        let (_client, mut events, engines) = connected_client(RetryPolicy::default()).await;
        let engine = engines.engine(0);

        engine.simulate(EngineEvent::Message(
            r#"{"type":"channel.visible","cid":"messaging:one"}"#.into(),
        ));
        engine.simulate(EngineEvent::Message(
            r#"{"type":"typing.start","cid":"messaging:one"}"#.into(),
        ));
        engine.simulate(EngineEvent::Message("not json".into()));
        engine.simulate(EngineEvent::Message(
            r#"{"type":"channel.visible","cid":"messaging:two"}"#.into(),
        ));
        engine.simulate(EngineEvent::Message(HEALTH_CHECK.into()));
        engine.simulate(EngineEvent::Message(
            r#"{"type":"channel.visible","cid":"messaging:three"}"#.into(),
        ));

        let mut cids = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            cids.push(event.cid().unwrap().id.clone());
        }
        assert_eq!(cids, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_new_endpoint_gets_new_engine() {
        let (client, _events, engines) = connected_client(RetryPolicy::default()).await;

        client.disconnect(DisconnectionSource::UserInitiated);
        wait_for(&client, |s| *s == ConnectionState::Disconnected { error: None }).await;

        client.connect();
        wait_for(&client, |s| *s == ConnectionState::Connecting).await;
        assert_eq!(engines.count(), 1);

        client.disconnect(DisconnectionSource::UserInitiated);
        wait_for(&client, |s| *s == ConnectionState::Disconnected { error: None }).await;
        client.set_endpoint("ws://other.test/connect");
        client.connect();
        wait_for(&client, |s| *s == ConnectionState::Connecting).await;

        assert_eq!(engines.count(), 2);
        let fresh = engines.engine(1);
        assert_eq!(fresh.url, "ws://other.test/connect");
        assert_eq!(fresh.connects.load(Ordering::SeqCst), 1);
    }
}
