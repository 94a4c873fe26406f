//! Persistent socket connections, one per address, shared by every caller.
//!
//! Handlers are keyed by `(address, event kind)` and looked up when an event
//! is dispatched, so a handler registered before `connect` still receives the
//! `Open` event and everything after it. When the peer closes the connection
//! (or the stream fails) the `Close` event is dispatched, then the connection
//! and every handler for that address are dropped.

use crate::config::{TlsRootConfig, TransportSecurity};
use crate::error::ApiError;
use crate::transport::tls;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL};

/// Wire-level frame exchanged with a [`SocketConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<SocketFrame, Error = ApiError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SocketFrame, ApiError>> + Send>>;

/// Opens the underlying bidirectional connection for an address.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// # Errors
    /// Any failure to establish the connection.
    async fn connect(
        &self,
        address: &str,
        protocols: &[String],
    ) -> Result<(FrameSink, FrameStream), ApiError>;
}

/// WebSocket connector backed by `tokio-tungstenite` and rustls.
pub struct TungsteniteConnector {
    transport: TransportSecurity,
    tls: Arc<rustls::ClientConfig>,
}

impl TungsteniteConnector {
    /// # Errors
    /// Returns `ApiError::Tls` if the root store cannot be built.
    pub fn new(tls_roots: TlsRootConfig, transport: TransportSecurity) -> Result<Self, ApiError> {
        Ok(Self {
            transport,
            tls: Arc::new(tls::client_config(tls_roots)?),
        })
    }

    fn check_scheme(&self, address: &str) -> Result<(), ApiError> {
        let scheme = address.split_once("://").map_or("", |(scheme, _)| scheme);
        match scheme {
            "wss" => Ok(()),
            "ws" if self.transport == TransportSecurity::AllowInsecureHttp => Ok(()),
            "ws" => Err(ApiError::InvalidScheme {
                scheme: "ws".to_owned(),
                reason: "WSS required (transport security is TlsOnly)".to_owned(),
            }),
            other => Err(ApiError::InvalidScheme {
                scheme: other.to_owned(),
                reason: "only ws:// and wss:// schemes are supported".to_owned(),
            }),
        }
    }
}

impl fmt::Debug for TungsteniteConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TungsteniteConnector")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(
        &self,
        address: &str,
        protocols: &[String],
    ) -> Result<(FrameSink, FrameStream), ApiError> {
        self.check_scheme(address)?;

        let mut request = address.into_client_request()?;
        if !protocols.is_empty() {
            request.headers_mut().insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&protocols.join(", "))?,
            );
        }

        let connector = tokio_tungstenite::Connector::Rustls(Arc::clone(&self.tls));
        let (socket, _response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector))
                .await?;
        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(ApiError::from)
            .with(|frame: SocketFrame| future::ready(Ok::<_, ApiError>(to_message(frame))));
        let stream = stream.filter_map(|message| future::ready(from_message(message)));
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn to_message(frame: SocketFrame) -> Message {
    match frame {
        SocketFrame::Text(text) => Message::Text(text),
        SocketFrame::Binary(bytes) => Message::Binary(bytes.to_vec()),
        SocketFrame::Close => Message::Close(None),
    }
}

fn from_message(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<SocketFrame, ApiError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(SocketFrame::Text(text))),
        Ok(Message::Binary(data)) => Some(Ok(SocketFrame::Binary(Bytes::from(data)))),
        Ok(Message::Close(_)) => Some(Ok(SocketFrame::Close)),
        // ping/pong are answered by tungstenite itself
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(e.into())),
    }
}

/// Payload of a message event or a `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Bytes),
}

impl SocketMessage {
    /// Text of the message; binary payloads are decoded lossily.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            SocketMessage::Text(text) => text.clone(),
            SocketMessage::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// # Errors
    /// Returns `ApiError::Json` if the payload is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let parsed = match self {
            SocketMessage::Text(text) => serde_json::from_str(text)?,
            SocketMessage::Binary(bytes) => serde_json::from_slice(bytes)?,
        };
        Ok(parsed)
    }
}

impl From<String> for SocketMessage {
    fn from(text: String) -> Self {
        SocketMessage::Text(text)
    }
}

impl From<&str> for SocketMessage {
    fn from(text: &str) -> Self {
        SocketMessage::Text(text.to_owned())
    }
}

impl From<Bytes> for SocketMessage {
    fn from(bytes: Bytes) -> Self {
        SocketMessage::Binary(bytes)
    }
}

/// Strings go out as-is, any other JSON value as its serialized text.
impl From<Value> for SocketMessage {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => SocketMessage::Text(text),
            other => SocketMessage::Text(other.to_string()),
        }
    }
}

impl From<SocketMessage> for SocketFrame {
    fn from(message: SocketMessage) -> Self {
        match message {
            SocketMessage::Text(text) => SocketFrame::Text(text),
            SocketMessage::Binary(bytes) => SocketFrame::Binary(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
    Open,
    Message,
    Close,
    Error,
}

impl SocketEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SocketEventKind::Open => "open",
            SocketEventKind::Message => "message",
            SocketEventKind::Close => "close",
            SocketEventKind::Error => "error",
        }
    }
}

impl fmt::Display for SocketEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(SocketMessage),
    Close,
    /// Stream failure, rendered as text; a `Close` event follows
    Error(String),
}

impl SocketEvent {
    #[must_use]
    pub fn kind(&self) -> SocketEventKind {
        match self {
            SocketEvent::Open => SocketEventKind::Open,
            SocketEvent::Message(_) => SocketEventKind::Message,
            SocketEvent::Close => SocketEventKind::Close,
            SocketEvent::Error(_) => SocketEventKind::Error,
        }
    }
}

pub type SocketHandler = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

/// Handle returned by `on`, used to unregister the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandlerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct Connection {
    generation: u64,
    outgoing: mpsc::UnboundedSender<SocketFrame>,
    open: AtomicBool,
}

impl Connection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outgoing.is_closed()
    }
}

/// Live connection for one address, as returned by [`SocketManager::socket`].
#[derive(Clone)]
pub struct SocketConnection {
    address: String,
    inner: Arc<Connection>,
}

impl SocketConnection {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

impl fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConnection")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .finish()
    }
}

type HandlerKey = (String, SocketEventKind);

#[derive(Default)]
struct SocketState {
    connections: DashMap<String, Arc<Connection>>,
    handlers: DashMap<HandlerKey, Vec<(HandlerId, SocketHandler)>>,
}

impl SocketState {
    fn dispatch(&self, address: &str, event: &SocketEvent) {
        // Clone out of the map so handlers may call on/off without deadlocking
        let handlers: Vec<SocketHandler> = self
            .handlers
            .get(&(address.to_owned(), event.kind()))
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        tracing::trace!(address, event = %event.kind(), handlers = handlers.len(), "socket event");
        for handler in handlers {
            handler(event);
        }
    }

    fn teardown(&self, address: &str, generation: u64) {
        let Some(conn) = self
            .connections
            .get(address)
            .map(|conn| Arc::clone(conn.value()))
        else {
            return;
        };
        if conn.generation != generation {
            tracing::trace!(address, "replaced socket finished");
            return;
        }
        conn.open.store(false, Ordering::Release);
        self.dispatch(address, &SocketEvent::Close);

        let removed = self
            .connections
            .remove_if(address, |_, conn| conn.generation == generation)
            .is_some();
        if removed {
            self.handlers.retain(|(addr, _), _| addr != address);
            tracing::debug!(address, "socket closed");
        }
    }
}

/// Connection manager for persistent sockets.
pub struct SocketManager {
    connector: Arc<dyn SocketConnector>,
    state: Arc<SocketState>,
    connect_gate: tokio::sync::Mutex<()>,
    generations: AtomicU64,
}

impl SocketManager {
    #[must_use]
    pub fn new(connector: Arc<dyn SocketConnector>) -> Self {
        Self {
            connector,
            state: Arc::new(SocketState::default()),
            connect_gate: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(1),
        }
    }

    /// Open a connection to `address` unless one is already open.
    ///
    /// # Errors
    /// Whatever the connector fails with.
    pub async fn connect(&self, address: &str, protocols: &[String]) -> Result<(), ApiError> {
        let _gate = self.connect_gate.lock().await;
        if self.is_open(address) {
            tracing::trace!(address, "socket already open");
            return Ok(());
        }

        let (sink, stream) = self.connector.connect(address, protocols).await?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (outgoing, rx) = mpsc::unbounded_channel();
        self.state.connections.insert(
            address.to_owned(),
            Arc::new(Connection {
                generation,
                outgoing,
                open: AtomicBool::new(true),
            }),
        );
        tracing::debug!(address, "socket connected");

        tokio::spawn(write_loop(rx, sink));
        self.state.dispatch(address, &SocketEvent::Open);
        tokio::spawn(read_loop(
            Arc::clone(&self.state),
            address.to_owned(),
            generation,
            stream,
        ));
        Ok(())
    }

    /// Live connection for `address`, if any.
    #[must_use]
    pub fn socket(&self, address: &str) -> Option<SocketConnection> {
        self.state
            .connections
            .get(address)
            .map(|conn| SocketConnection {
                address: address.to_owned(),
                inner: Arc::clone(conn.value()),
            })
    }

    #[must_use]
    pub fn is_open(&self, address: &str) -> bool {
        self.state
            .connections
            .get(address)
            .is_some_and(|conn| conn.is_open())
    }

    /// Register `handler` for `kind` events on `address`, connected or not.
    pub fn on(
        &self,
        address: &str,
        kind: SocketEventKind,
        handler: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId::next();
        self.state
            .handlers
            .entry((address.to_owned(), kind))
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler; returns whether it was registered.
    pub fn off(&self, address: &str, kind: SocketEventKind, id: HandlerId) -> bool {
        let key = (address.to_owned(), kind);
        let removed = match self.state.handlers.get_mut(&key) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(entry, _)| *entry != id);
                handlers.len() != before
            }
            None => false,
        };
        self.state.handlers.remove_if(&key, |_, handlers| handlers.is_empty());
        removed
    }

    /// Transmit `message` on the open connection for `address`.
    ///
    /// # Errors
    /// Returns `ApiError::ConnectionNotOpen` when there is no open connection;
    /// nothing is queued.
    pub fn send(&self, address: &str, message: impl Into<SocketMessage>) -> Result<(), ApiError> {
        let not_open = || ApiError::ConnectionNotOpen {
            address: address.to_owned(),
        };
        let conn = self
            .state
            .connections
            .get(address)
            .map(|conn| Arc::clone(conn.value()))
            .ok_or_else(not_open)?;
        if !conn.is_open() {
            return Err(not_open());
        }
        conn.outgoing
            .send(message.into().into())
            .map_err(|_| not_open())
    }

    /// Serialize `value` as JSON text and send it.
    ///
    /// # Errors
    /// Returns `ApiError::Json` or `ApiError::ConnectionNotOpen`.
    pub fn send_json<T: Serialize>(&self, address: &str, value: &T) -> Result<(), ApiError> {
        let text = serde_json::to_string(value)?;
        self.send(address, SocketMessage::Text(text))
    }

    /// Ask the peer to close the connection; no-op without one.
    ///
    /// Sends fail immediately afterwards. The address is released once the
    /// peer confirms, at which point `Close` handlers run.
    pub fn close(&self, address: &str) {
        let Some(conn) = self
            .state
            .connections
            .get(address)
            .map(|conn| Arc::clone(conn.value()))
        else {
            return;
        };
        if conn.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(address, "closing socket");
            if conn.outgoing.send(SocketFrame::Close).is_err() {
                tracing::trace!(address, "socket writer already stopped");
            }
        }
    }
}

impl fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketManager")
            .field("connections", &self.state.connections.len())
            .finish_non_exhaustive()
    }
}

async fn write_loop(mut rx: mpsc::UnboundedReceiver<SocketFrame>, mut sink: FrameSink) {
    while let Some(frame) = rx.recv().await {
        let closing = frame == SocketFrame::Close;
        if let Err(e) = sink.send(frame).await {
            tracing::warn!(error = %e, "socket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::trace!(error = %e, "socket sink close failed");
    }
}

async fn read_loop(state: Arc<SocketState>, address: String, generation: u64, mut stream: FrameStream) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(SocketFrame::Text(text)) => {
                state.dispatch(&address, &SocketEvent::Message(SocketMessage::Text(text)));
            }
            Ok(SocketFrame::Binary(bytes)) => {
                state.dispatch(&address, &SocketEvent::Message(SocketMessage::Binary(bytes)));
            }
            Ok(SocketFrame::Close) => break,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "socket stream failed");
                state.dispatch(&address, &SocketEvent::Error(e.to_string()));
                break;
            }
        }
    }
    state.teardown(&address, generation);
}
