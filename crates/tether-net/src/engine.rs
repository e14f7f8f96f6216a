//! Websocket transport engines.
//!
//! An engine owns at most one duplex connection and reports what happens to
//! it through an `EngineEvent` channel. It never retries on its own: the
//! owner decides whether and when to call `connect()` again.
//!
//! Two variants exist. `AmbientRuntimeEngine` spawns its session on the
//! tokio runtime the caller is already running on; `DedicatedRuntimeEngine`
//! carries a private single-worker runtime for callers that have none.
//! `create_engine` picks one at construction time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tether_shared::constants::{CONNECT_TIMEOUT_SECS, PING_INTERVAL_SECS, PONG_TIMEOUT_SECS};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Configuration / events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// How long to wait for any inbound frame after a ping.
    pub pong_timeout: Duration,
    /// Upper bound on the websocket handshake.
    pub connect_timeout: Duration,
    /// Use the caller's tokio runtime when one is available.
    pub prefer_ambient_runtime: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(PONG_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            prefer_ambient_runtime: true,
        }
    }
}

/// Callbacks from an engine, delivered in order on a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Connected,
    /// `None` when the owner asked for the disconnect.
    Disconnected(Option<EngineError>),
    Message(String),
    Pong,
}

/// Uniform interface over the transport variants.
pub trait WebSocketEngine: Send + Sync {
    fn url(&self) -> &str;

    /// Open the connection. No-op while a session is connecting or open.
    fn connect(&self);

    /// Close the connection and report `Disconnected(None)`.
    fn disconnect(&self);

    /// Send a liveness ping outside the regular schedule.
    fn send_ping(&self);
}

// ---------------------------------------------------------------------------
// Shared session slot
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum SessionCommand {
    Ping,
    Close,
}

struct SessionHandle {
    generation: u64,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

#[derive(Default)]
struct Slot {
    current: Option<SessionHandle>,
    next_generation: u64,
}

/// State shared between an engine and its running session.
///
/// A session only emits while it is the current generation, and it emits
/// while holding the slot lock, so nothing it sends can land after the
/// `Disconnected` that ended it.
struct Shared {
    url: String,
    config: EngineConfig,
    slot: Mutex<Slot>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Shared {
    fn new(url: String, config: EngineConfig, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            url,
            config,
            slot: Mutex::new(Slot::default()),
            events,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the slot for a new session, unless one already exists.
    fn begin(&self) -> Option<(u64, mpsc::UnboundedReceiver<SessionCommand>)> {
        let mut slot = self.slot();
        if slot.current.is_some() {
            debug!(url = %self.url, "Connect ignored, session already active");
            return None;
        }
        let generation = slot.next_generation;
        slot.next_generation += 1;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        slot.current = Some(SessionHandle { generation, cmd_tx });
        Some((generation, cmd_rx))
    }

    fn emit(&self, generation: u64, event: EngineEvent) -> bool {
        let slot = self.slot();
        if slot.current.as_ref().map(|h| h.generation) != Some(generation) {
            return false;
        }
        self.events.send(event).is_ok()
    }

    /// The session ended on its own.
    fn finish(&self, generation: u64, error: Option<EngineError>) {
        let mut slot = self.slot();
        if slot.current.as_ref().map(|h| h.generation) == Some(generation) {
            slot.current = None;
            let _ = self.events.send(EngineEvent::Disconnected(error));
        }
    }

    fn close(&self) {
        let mut slot = self.slot();
        if let Some(handle) = slot.current.take() {
            let _ = handle.cmd_tx.send(SessionCommand::Close);
            let _ = self.events.send(EngineEvent::Disconnected(None));
        }
    }

    /// Close without reporting anything. Used when the engine goes away.
    fn detach(&self) {
        if let Some(handle) = self.slot().current.take() {
            let _ = handle.cmd_tx.send(SessionCommand::Close);
        }
    }

    fn ping(&self) {
        if let Some(handle) = self.slot().current.as_ref() {
            let _ = handle.cmd_tx.send(SessionCommand::Ping);
        }
    }
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

async fn run_session(
    shared: Arc<Shared>,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let config = shared.config.clone();
    debug!(url = %shared.url, generation, "Opening websocket");

    let handshake = tokio_tungstenite::connect_async(shared.url.as_str());
    let ws = match tokio::time::timeout(config.connect_timeout, handshake).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!(url = %shared.url, error = %e, "Websocket handshake failed");
            shared.finish(generation, Some(EngineError::Connect(e.to_string())));
            return;
        }
        Err(_) => {
            warn!(url = %shared.url, "Websocket handshake timed out");
            shared.finish(generation, Some(EngineError::ConnectTimeout));
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();

    if !shared.emit(generation, EngineEvent::Connected) {
        // Disconnected or dropped while the handshake was in flight.
        let _ = sink.close().await;
        return;
    }
    info!(url = %shared.url, "Websocket connected");

    let mut ping_timer =
        tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    let mut pong_deadline: Option<Instant> = None;

    let error = loop {
        let deadline = pong_deadline;
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        pong_deadline = None;
                        shared.emit(generation, EngineEvent::Message(text));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                        shared.emit(generation, EngineEvent::Pong);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        pong_deadline = None;
                        debug!(len = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            None => None,
                            Some(f) if f.code == CloseCode::Normal => None,
                            Some(f) => Some(EngineError::Closed {
                                code: u16::from(f.code),
                                reason: f.reason.into_owned(),
                            }),
                        };
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break Some(EngineError::Transport(e.to_string())),
                    None => break Some(EngineError::Transport("stream ended".into())),
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(SessionCommand::Ping) => {
                        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                            break Some(EngineError::Transport(e.to_string()));
                        }
                        pong_deadline.get_or_insert(Instant::now() + config.pong_timeout);
                    }
                    Some(SessionCommand::Close) | None => {
                        debug!(url = %shared.url, "Closing websocket");
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        return;
                    }
                }
            }

            _ = ping_timer.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break Some(EngineError::Transport(e.to_string()));
                }
                pong_deadline.get_or_insert(Instant::now() + config.pong_timeout);
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!(url = %shared.url, "Pong not received in time");
                break Some(EngineError::PongTimeout);
            }
        }
    };

    if let Some(ref e) = error {
        info!(url = %shared.url, error = %e, "Websocket disconnected");
    }
    shared.finish(generation, error);
}

// ---------------------------------------------------------------------------
// Engine variants
// ---------------------------------------------------------------------------

/// Runs its session on the runtime that created it.
pub struct AmbientRuntimeEngine {
    shared: Arc<Shared>,
    handle: Handle,
}

impl AmbientRuntimeEngine {
    pub fn new(
        url: impl Into<String>,
        config: EngineConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
        handle: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(url.into(), config, events)),
            handle,
        }
    }
}

impl WebSocketEngine for AmbientRuntimeEngine {
    fn url(&self) -> &str {
        &self.shared.url
    }

    fn connect(&self) {
        if let Some((generation, cmd_rx)) = self.shared.begin() {
            self.handle
                .spawn(run_session(self.shared.clone(), generation, cmd_rx));
        }
    }

    fn disconnect(&self) {
        self.shared.close();
    }

    fn send_ping(&self) {
        self.shared.ping();
    }
}

impl Drop for AmbientRuntimeEngine {
    fn drop(&mut self) {
        self.shared.detach();
    }
}

/// Owns a private single-worker runtime for its sessions.
pub struct DedicatedRuntimeEngine {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
}

impl DedicatedRuntimeEngine {
    pub fn new(
        url: impl Into<String>,
        config: EngineConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tether-ws")
            .enable_all()
            .build()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared::new(url.into(), config, events)),
            runtime: Some(runtime),
        })
    }
}

impl WebSocketEngine for DedicatedRuntimeEngine {
    fn url(&self) -> &str {
        &self.shared.url
    }

    fn connect(&self) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        if let Some((generation, cmd_rx)) = self.shared.begin() {
            runtime.spawn(run_session(self.shared.clone(), generation, cmd_rx));
        }
    }

    fn disconnect(&self) {
        self.shared.close();
    }

    fn send_ping(&self) {
        self.shared.ping();
    }
}

impl Drop for DedicatedRuntimeEngine {
    fn drop(&mut self) {
        self.shared.detach();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Build the preferred engine for the current context.
pub fn create_engine(
    url: &str,
    config: &EngineConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<Box<dyn WebSocketEngine>, EngineError> {
    match Handle::try_current() {
        Ok(handle) if config.prefer_ambient_runtime => {
            debug!(url, "Using ambient runtime engine");
            Ok(Box::new(AmbientRuntimeEngine::new(
                url,
                config.clone(),
                events,
                handle,
            )))
        }
        _ => {
            debug!(url, "Using dedicated runtime engine");
            Ok(Box::new(DedicatedRuntimeEngine::new(
                url,
                config.clone(),
                events,
            )?))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("event channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) {
        let res = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(res.is_err(), "unexpected event: {res:?}");
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            prefer_ambient_runtime: true,
        }
    }

    /// Accepts connections, greets each with `frames`, then echoes until closed.
    async fn spawn_server(frames: Vec<Message>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let frames = frames.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    for frame in frames {
                        let _ = ws.send(frame).await;
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        (url, accepted)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (url, accepted) = spawn_server(vec![Message::Text("hello".into())]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = create_engine(&url, &test_config(), tx).unwrap();

        engine.connect();
        engine.connect();
        assert_eq!(next_event(&mut rx).await, EngineEvent::Connected);
        engine.connect();

        assert_eq!(
            next_event(&mut rx).await,
            EngineEvent::Message("hello".into())
        );
        assert_quiet(&mut rx).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_reports_once_then_stays_quiet() {
        let (url, _) = spawn_server(vec![]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = create_engine(&url, &test_config(), tx).unwrap();

        engine.connect();
        assert_eq!(next_event(&mut rx).await, EngineEvent::Connected);

        engine.disconnect();
        assert_eq!(next_event(&mut rx).await, EngineEvent::Disconnected(None));
        engine.disconnect();
        assert_quiet(&mut rx).await;

        // A fresh session can be opened afterwards.
        engine.connect();
        assert_eq!(next_event(&mut rx).await, EngineEvent::Connected);
    }

    #[tokio::test]
    async fn test_missing_pong_disconnects_with_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Complete the handshake, then never read again.
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = EngineConfig {
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = create_engine(&url, &config, tx).unwrap();

        engine.connect();
        assert_eq!(next_event(&mut rx).await, EngineEvent::Connected);
        assert_eq!(
            next_event(&mut rx).await,
            EngineEvent::Disconnected(Some(EngineError::PongTimeout))
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = create_engine(&url, &test_config(), tx).unwrap();
        engine.connect();

        match next_event(&mut rx).await {
            EngineEvent::Disconnected(Some(EngineError::Connect(_))) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_binary_frames_are_not_delivered() {
        let (url, _) = spawn_server(vec![
            Message::Binary(vec![1, 2, 3]),
            Message::Text("after".into()),
        ])
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = create_engine(&url, &test_config(), tx).unwrap();

        engine.connect();
        assert_eq!(next_event(&mut rx).await, EngineEvent::Connected);
        assert_eq!(
            next_event(&mut rx).await,
            EngineEvent::Message("after".into())
        );
    }

    #[tokio::test]
    async fn test_server_close_with_error_code() {
        use std::borrow::Cow;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        let (url, _) = spawn_server(vec![Message::Close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Borrowed("go away"),
        }))])
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = create_engine(&url, &test_config(), tx).unwrap();

        engine.connect();
        assert_eq!(next_event(&mut rx).await, EngineEvent::Connected);
        assert_eq!(
            next_event(&mut rx).await,
            EngineEvent::Disconnected(Some(EngineError::Closed {
                code: 1008,
                reason: "go away".into(),
            }))
        );
    }
}
