//! Connection management: event loop, outbound queueing, and reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::config::{ConnectConfig, ReconnectPolicy, TokenTransport};
use crate::error::ConnectionError;
use crate::frame::frame_type;
use crate::queue::OutboundQueue;
use crate::registry::{ListenerFn, ListenerId, ListenerRegistry};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

/// Close code used when the connection is disposed without an explicit
/// disconnect (normal closure).
const NORMAL_CLOSE: u16 = 1000;
/// Close code reported to `close` listeners when the channel ended without
/// a close frame (abnormal closure).
const ABNORMAL_CLOSE: u16 = 1006;

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Handle to a realtime connection.
///
/// Created in the Idle state; nothing is dialed until [`connect`]. All
/// clones drive the same underlying channel, registry, and outbound queue;
/// a second independent channel (say a lobby socket next to a game socket)
/// is a second [`Connection`]. The background task ends when the last
/// handle is dropped.
///
/// [`connect`]: Connection::connect
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    next_listener: Arc<AtomicU64>,
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectionError>>),
    Send(Value),
    On {
        kind: String,
        id: ListenerId,
        callback: ListenerFn,
    },
    Off {
        kind: String,
        id: ListenerId,
    },
    Disconnect {
        code: u16,
        reason: String,
    },
}

impl Connection {
    /// Create the connection and spawn its event loop. Must be called from
    /// within a tokio runtime.
    pub fn new(config: ConnectConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        tokio::spawn(run_event_loop(EventLoopState {
            config,
            cmd_rx,
            state_tx,
            registry: ListenerRegistry::default(),
            queue: OutboundQueue::default(),
            waiters: Vec::new(),
        }));
        Self {
            cmd_tx,
            state_rx,
            next_listener: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the channel. Idempotent: while an attempt is in flight,
    /// concurrent callers await the same attempt rather than dialing a
    /// second channel; when already Open it returns immediately.
    ///
    /// On handshake failure the state returns to Closed and the error is
    /// delivered to every waiting caller. Reconnecting after that is the
    /// caller's decision unless [`ConnectConfig::reconnect`] is set, which
    /// only governs channels lost after they were established.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect(tx))
            .map_err(|_| ConnectionError::Dropped)?;
        rx.await.map_err(|_| ConnectionError::Dropped)?
    }

    /// Transmit a payload, or queue it when the channel is not open.
    ///
    /// Returns `true` when handed to an open channel, `false` when queued.
    /// Queued payloads are sent in order on the next open and survive
    /// disconnects; they are only lost when the connection is dropped.
    pub fn send(&self, payload: Value) -> bool {
        let open = matches!(*self.state_rx.borrow(), ConnectionState::Open);
        if self.cmd_tx.send(Command::Send(payload)).is_err() {
            return false;
        }
        open
    }

    /// Register a callback for a message type. Reserved types: `message`
    /// (every frame), `error`, `close`, `reconnect-failed`. Never fails;
    /// registering the same closure twice makes it fire twice.
    pub fn on(
        &self,
        kind: impl Into<String>,
        callback: impl FnMut(&Value) + Send + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let _ = self.cmd_tx.send(Command::On {
            kind: kind.into(),
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove one registration. Unknown ids are ignored.
    pub fn off(&self, kind: &str, id: ListenerId) {
        let _ = self.cmd_tx.send(Command::Off {
            kind: kind.to_string(),
            id,
        });
    }

    /// Close the physical channel. Idempotent; a no-op without a channel.
    /// The outbound queue and listener registry survive, so a later
    /// [`connect`](Connection::connect) needs no re-subscription.
    pub fn disconnect(&self, code: u16, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Disconnect {
            code,
            reason: reason.into(),
        });
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct EventLoopState {
    config: ConnectConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    registry: ListenerRegistry,
    queue: OutboundQueue,
    waiters: Vec<oneshot::Sender<Result<(), ConnectionError>>>,
}

impl EventLoopState {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn fail_waiters(&mut self, err: &ConnectionError) {
        for tx in self.waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

async fn run_event_loop(mut p: EventLoopState) {
    loop {
        // No channel and no attempt in flight: only commands can arrive.
        let Some(cmd) = p.cmd_rx.recv().await else {
            return;
        };
        match cmd {
            Command::Connect(tx) => {
                p.waiters.push(tx);
                if run_session(&mut p).await {
                    return;
                }
            }
            Command::Send(payload) => p.queue.push(payload),
            Command::On { kind, id, callback } => p.registry.add(kind, id, callback),
            Command::Off { kind, id } => p.registry.remove(&kind, id),
            Command::Disconnect { .. } => {}
        }
    }
}

/// What ended an open phase.
enum SessionEnd {
    /// All handles dropped; exit the loop.
    Dispose,
    /// Explicit disconnect; back to the idle command loop.
    Explicit,
    /// The channel was lost unexpectedly.
    Lost,
}

enum DialResult {
    Socket(Box<WsStream>),
    Failed(ConnectionError),
    Cancelled,
    Dispose,
}

enum ReconnectResult {
    Socket(Box<WsStream>),
    GaveUp,
    Cancelled,
    Dispose,
}

/// One connected session: the initial dial, the open phase, and the
/// reconnect loop for lost channels. Returns `true` when the event loop
/// should exit entirely.
async fn run_session(p: &mut EventLoopState) -> bool {
    p.set_state(ConnectionState::Connecting);
    let mut ws = match dial_processing_cmds(p).await {
        DialResult::Socket(ws) => ws,
        DialResult::Failed(e) => {
            tracing::warn!("connect failed: {e}");
            p.set_state(ConnectionState::Closed);
            p.fail_waiters(&e);
            return false;
        }
        DialResult::Cancelled => {
            p.set_state(ConnectionState::Closed);
            return false;
        }
        DialResult::Dispose => return true,
    };

    loop {
        let (mut write, mut read) = (*ws).split();
        match run_open(p, &mut write, &mut read).await {
            SessionEnd::Dispose => return true,
            SessionEnd::Explicit => return false,
            SessionEnd::Lost => {
                p.set_state(ConnectionState::Closed);
                let Some(policy) = p.config.reconnect.clone() else {
                    return false;
                };
                match reconnect_with_backoff(p, &policy).await {
                    ReconnectResult::Socket(new_ws) => {
                        ws = new_ws;
                    }
                    ReconnectResult::GaveUp => {
                        tracing::error!(
                            attempts = policy.max_attempts,
                            "reconnect attempts exhausted"
                        );
                        let frame = serde_json::json!({ "type": frame_type::RECONNECT_FAILED });
                        p.registry.notify(frame_type::RECONNECT_FAILED, &frame);
                        p.fail_waiters(&ConnectionError::Closed);
                        return false;
                    }
                    ReconnectResult::Cancelled => {
                        p.fail_waiters(&ConnectionError::Closed);
                        return false;
                    }
                    ReconnectResult::Dispose => return true,
                }
            }
        }
    }
}

/// Dial while keeping the command channel live: sends queue up, listeners
/// register, and late `connect` callers join the in-flight attempt.
async fn dial_processing_cmds(p: &mut EventLoopState) -> DialResult {
    let dial = tokio::time::timeout(p.config.connect_timeout, dial(&p.config));
    tokio::pin!(dial);
    loop {
        tokio::select! {
            res = &mut dial => {
                return match res {
                    Ok(Ok(ws)) => DialResult::Socket(Box::new(ws)),
                    Ok(Err(e)) => DialResult::Failed(e),
                    Err(_) => DialResult::Failed(ConnectionError::ConnectTimeout),
                };
            }
            cmd = p.cmd_rx.recv() => match cmd {
                None => return DialResult::Dispose,
                Some(Command::Connect(tx)) => p.waiters.push(tx),
                Some(Command::Send(payload)) => p.queue.push(payload),
                Some(Command::On { kind, id, callback }) => p.registry.add(kind, id, callback),
                Some(Command::Off { kind, id }) => p.registry.remove(&kind, id),
                Some(Command::Disconnect { .. }) => {
                    for tx in p.waiters.drain(..) {
                        let _ = tx.send(Err(ConnectionError::Closed));
                    }
                    return DialResult::Cancelled;
                }
            }
        }
    }
}

/// The open phase: resolve waiting connect callers, drain the queue, then
/// pump frames and commands until the channel ends one way or another.
async fn run_open(p: &mut EventLoopState, write: &mut WsWrite, read: &mut WsRead) -> SessionEnd {
    p.set_state(ConnectionState::Open);
    for tx in p.waiters.drain(..) {
        let _ = tx.send(Ok(()));
    }

    if !p.queue.is_empty() {
        tracing::info!(queued = p.queue.len(), "draining outbound queue");
    }
    while let Some(payload) = p.queue.pop() {
        if let Err(e) = transmit(write, &payload).await {
            tracing::warn!("send failed while draining queue: {e}");
            p.queue.requeue_front(payload);
            return SessionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(tungstenite::Message::Text(raw))) => {
                    dispatch_frame(&mut p.registry, raw.as_str());
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    let _ = write.send(tungstenite::Message::Pong(data)).await;
                }
                Some(Ok(tungstenite::Message::Close(cf))) => {
                    let (code, reason) = cf
                        .as_ref()
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((ABNORMAL_CLOSE, String::new()));
                    tracing::info!(code, reason = %reason, "channel closed by server");
                    notify_close(&mut p.registry, code, &reason);
                    return SessionEnd::Lost;
                }
                Some(Ok(_)) => {
                    // Binary and pong frames are not part of the protocol.
                }
                Some(Err(e)) => {
                    tracing::warn!("websocket error: {e}");
                    notify_error(&mut p.registry, &e.to_string());
                    notify_close(&mut p.registry, ABNORMAL_CLOSE, "");
                    return SessionEnd::Lost;
                }
                None => {
                    tracing::info!("channel stream ended");
                    notify_close(&mut p.registry, ABNORMAL_CLOSE, "");
                    return SessionEnd::Lost;
                }
            },
            cmd = p.cmd_rx.recv() => match cmd {
                None => {
                    let _ = write.send(close_message(NORMAL_CLOSE, "client disposed")).await;
                    return SessionEnd::Dispose;
                }
                Some(Command::Connect(tx)) => {
                    let _ = tx.send(Ok(()));
                }
                Some(Command::Send(payload)) => {
                    if let Err(e) = transmit(write, &payload).await {
                        tracing::warn!("send failed, keeping payload queued: {e}");
                        p.queue.requeue_front(payload);
                        notify_close(&mut p.registry, ABNORMAL_CLOSE, "");
                        return SessionEnd::Lost;
                    }
                }
                Some(Command::On { kind, id, callback }) => p.registry.add(kind, id, callback),
                Some(Command::Off { kind, id }) => p.registry.remove(&kind, id),
                Some(Command::Disconnect { code, reason }) => {
                    p.set_state(ConnectionState::Closing);
                    let _ = write.send(close_message(code, &reason)).await;
                    p.set_state(ConnectionState::Closed);
                    notify_close(&mut p.registry, code, &reason);
                    return SessionEnd::Explicit;
                }
            }
        }
    }
}

/// Sleep out the backoff delays and redial until one attempt succeeds, the
/// policy is exhausted, or the caller disconnects. Commands keep flowing
/// the whole time; sends queue up for the next open.
async fn reconnect_with_backoff(p: &mut EventLoopState, policy: &ReconnectPolicy) -> ReconnectResult {
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        tracing::info!(attempt, max = policy.max_attempts, ?delay, "scheduling reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                cmd = p.cmd_rx.recv() => match cmd {
                    None => return ReconnectResult::Dispose,
                    Some(Command::Connect(tx)) => p.waiters.push(tx),
                    Some(Command::Send(payload)) => p.queue.push(payload),
                    Some(Command::On { kind, id, callback }) => p.registry.add(kind, id, callback),
                    Some(Command::Off { kind, id }) => p.registry.remove(&kind, id),
                    Some(Command::Disconnect { .. }) => return ReconnectResult::Cancelled,
                }
            }
        }

        p.set_state(ConnectionState::Connecting);
        match dial_processing_cmds(p).await {
            DialResult::Socket(ws) => {
                tracing::info!(attempt, "reconnected");
                return ReconnectResult::Socket(ws);
            }
            DialResult::Failed(e) => {
                tracing::warn!(attempt, "reconnect attempt failed: {e}");
                p.set_state(ConnectionState::Closed);
            }
            DialResult::Cancelled => return ReconnectResult::Cancelled,
            DialResult::Dispose => return ReconnectResult::Dispose,
        }
    }
    ReconnectResult::GaveUp
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

/// Fetch the credential and perform the WebSocket handshake.
async fn dial(config: &ConnectConfig) -> Result<WsStream, ConnectionError> {
    let token = (config.get_token)()
        .await
        .map_err(|e| ConnectionError::TokenFetch(Arc::from(e)))?;
    let request = build_request(config, &token)?;
    let (ws, _resp) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Build the handshake request: endpoint params plus the credential,
/// carried as a `token.{jwt}` subprotocol or a query parameter.
fn build_request(
    config: &ConnectConfig,
    token: &str,
) -> Result<tungstenite::handshake::client::Request, ConnectionError> {
    let mut url = url::Url::parse(&format!("{}{}", config.ws_base, config.endpoint))?;
    if config.params.is_some() || config.transport == TokenTransport::QueryParam {
        let mut query = url.query_pairs_mut();
        if let Some(params) = &config.params {
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        if config.transport == TokenTransport::QueryParam {
            query.append_pair("token", token);
        }
    }
    let mut request = url.as_str().into_client_request()?;
    if config.transport == TokenTransport::Subprotocol {
        let value = tungstenite::http::HeaderValue::from_str(&format!("token.{token}"))
            .map_err(|_| ConnectionError::InvalidCredential)?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", value);
    }
    Ok(request)
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

/// Parse an inbound text frame and dispatch it by its `type` tag.
/// Malformed frames are logged and dropped; dispatch never fails.
fn dispatch_frame(registry: &mut ListenerRegistry, raw: &str) {
    let frame: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("dropping unparsable frame: {e}");
            return;
        }
    };
    let Some(kind) = frame.get("type").and_then(Value::as_str).map(str::to_string) else {
        tracing::warn!("dropping frame without a type tag");
        return;
    };
    registry.dispatch(&kind, &frame);
}

fn notify_error(registry: &mut ListenerRegistry, message: &str) {
    let frame = serde_json::json!({ "type": frame_type::ERROR, "message": message });
    registry.notify(frame_type::ERROR, &frame);
}

fn notify_close(registry: &mut ListenerRegistry, code: u16, reason: &str) {
    let frame = serde_json::json!({
        "type": frame_type::CLOSE,
        "code": code,
        "reason": reason,
    });
    registry.notify(frame_type::CLOSE, &frame);
}

async fn transmit(write: &mut WsWrite, payload: &Value) -> Result<(), tungstenite::Error> {
    write
        .send(tungstenite::Message::Text(payload.to_string().into()))
        .await
}

fn close_message(code: u16, reason: &str) -> tungstenite::Message {
    tungstenite::Message::Close(Some(tungstenite::protocol::CloseFrame {
        code: tungstenite::protocol::frame::coding::CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
