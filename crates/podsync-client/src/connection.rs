//! Push connection lifecycle.
//!
//! One connection per process. Each connection runs in its own reader task
//! that forwards lifecycle events, tagged with the connection's generation,
//! into a single channel owned by the sync engine. Replacing the connection
//! aborts the old task first; events still queued from it carry a stale
//! generation and are never dispatched.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Stream, StreamExt};
use podsync_proto::protocol::ServerConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

/// Path of the push endpoint below the server base URL.
pub const PUSH_PATH: &str = "ws";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported scheme {0:?} (expected http, https, ws or wss)")]
    UnsupportedScheme(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Derive the push endpoint from the configured server URL.
///
/// `http://host:8000/` becomes `ws://host:8000/ws`, `https://host/pods`
/// becomes `wss://host/pods/ws`. Query and fragment are dropped.
pub fn push_endpoint(server_url: &str) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(server_url).map_err(|e| ConnectionError::InvalidUrl {
        url: server_url.to_string(),
        reason: e.to_string(),
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectionError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::UnsupportedScheme(scheme.to_string()))?;

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.join(PUSH_PATH).map_err(|e| ConnectionError::InvalidUrl {
        url: server_url.to_string(),
        reason: e.to_string(),
    })
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Text frames from an open connection. The stream ends when the peer closes.
pub type FrameStream = BoxStream<'static, Result<String, ConnectionError>>;

/// Opens push connections. The production implementation is
/// [`WsConnector`]; tests plug in an in-memory one.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: Url) -> BoxFuture<'static, Result<FrameStream, ConnectionError>>;
}

/// WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&self, endpoint: Url) -> BoxFuture<'static, Result<FrameStream, ConnectionError>> {
        async move {
            let (ws, _response) = tokio_tungstenite::connect_async(endpoint.as_str())
                .await
                .map_err(|e| ConnectionError::Connect(e.to_string()))?;

            let frames = text_frames(ws);
            Ok(frames)
        }
        .boxed()
    }
}

/// Map raw WebSocket messages to text frames. Pings are answered by
/// tungstenite itself; a Close ends the stream.
pub fn text_frames<S>(messages: S) -> FrameStream
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Send + 'static,
{
    messages
        .take_while(|msg| futures_util::future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        warn!("push: dropping non-UTF-8 binary frame ({} bytes)", bytes.len());
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
            }
        })
        .boxed()
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No configuration yet (or it was withdrawn).
    Idle,
    Connecting,
    Open,
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Opened,
    Message(String),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub kind: ConnectionEventKind,
}

/// The four lifecycle callbacks. Exactly one handler receives the events of
/// the current connection.
pub trait ConnectionHandler {
    fn on_open(&mut self, endpoint: &Url);
    fn on_message(&mut self, frame: String);
    fn on_error(&mut self, error: &str);
    fn on_close(&mut self);
}

/// Token for the live connection. Dropping or unsubscribing it aborts the
/// reader task.
pub struct Subscription {
    generation: u64,
    endpoint: Url,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    state: ConnectionState,
    config: Option<Arc<ServerConfig>>,
    active: Option<Subscription>,
    generation: u64,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager and the receiving end its connections report to.
    pub fn new(connector: C) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            connector: Arc::new(connector),
            events_tx,
            state: ConnectionState::Idle,
            config: None,
            active: None,
            generation: 0,
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> Option<&Url> {
        self.active.as_ref().map(Subscription::endpoint)
    }

    /// True when `config` is not the exact configuration (by reference) the
    /// current connection was built from.
    pub fn is_stale_for(&self, config: &Arc<ServerConfig>) -> bool {
        match &self.config {
            Some(current) => !Arc::ptr_eq(current, config),
            None => true,
        }
    }

    /// Tear down whatever is live and connect for `config`.
    pub fn open(&mut self, config: Arc<ServerConfig>) -> Result<(), ConnectionError> {
        self.teardown();
        self.config = Some(Arc::clone(&config));

        let endpoint = match push_endpoint(&config.server_url) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("push: cannot derive endpoint: {}", e);
                self.state = ConnectionState::Error(e.to_string());
                return Err(e);
            }
        };

        self.generation += 1;
        let generation = self.generation;
        info!("push: connecting to {} (generation {})", endpoint, generation);

        let task = tokio::spawn(run_connection(
            Arc::clone(&self.connector),
            endpoint.clone(),
            generation,
            self.events_tx.clone(),
        ));
        self.active = Some(Subscription {
            generation,
            endpoint,
            task,
        });
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Re-create the connection from the current configuration.
    pub fn recreate(&mut self) -> Result<(), ConnectionError> {
        match self.config.clone() {
            Some(config) => self.open(config),
            None => Ok(()),
        }
    }

    /// Drop the connection and forget the configuration.
    pub fn close(&mut self) {
        self.teardown();
        self.config = None;
        self.state = ConnectionState::Idle;
    }

    fn teardown(&mut self) {
        if let Some(sub) = self.active.take() {
            debug!(
                "push: tearing down generation {} ({})",
                sub.generation, sub.endpoint
            );
            sub.unsubscribe();
        }
    }

    /// Route one event to `handler` if it belongs to the live connection.
    /// Returns false for events from a superseded connection.
    pub fn dispatch(&mut self, event: ConnectionEvent, handler: &mut impl ConnectionHandler) -> bool {
        let live = self
            .active
            .as_ref()
            .is_some_and(|sub| sub.generation == event.generation);
        if !live {
            debug!(
                "push: discarding {:?} from stale generation {}",
                event.kind, event.generation
            );
            return false;
        }

        match event.kind {
            ConnectionEventKind::Opened => {
                self.state = ConnectionState::Open;
                if let Some(sub) = &self.active {
                    handler.on_open(&sub.endpoint);
                }
            }
            ConnectionEventKind::Message(frame) => handler.on_message(frame),
            ConnectionEventKind::Error(e) => {
                self.state = ConnectionState::Error(e.clone());
                handler.on_error(&e);
            }
            ConnectionEventKind::Closed => {
                if !matches!(self.state, ConnectionState::Error(_)) {
                    self.state = ConnectionState::Closed;
                }
                handler.on_close();
            }
        }
        true
    }
}

async fn run_connection<C: Connector>(
    connector: Arc<C>,
    endpoint: Url,
    generation: u64,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let send = |kind| {
        events_tx
            .send(ConnectionEvent { generation, kind })
            .is_ok()
    };

    let mut frames = match connector.connect(endpoint).await {
        Ok(frames) => frames,
        Err(e) => {
            send(ConnectionEventKind::Error(e.to_string()));
            send(ConnectionEventKind::Closed);
            return;
        }
    };
    if !send(ConnectionEventKind::Opened) {
        return;
    }

    while let Some(frame) = frames.next().await {
        let delivered = match frame {
            Ok(text) => send(ConnectionEventKind::Message(text)),
            Err(e) => {
                send(ConnectionEventKind::Error(e.to_string()));
                break;
            }
        };
        if !delivered {
            return;
        }
    }
    send(ConnectionEventKind::Closed);
}
