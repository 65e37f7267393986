//! The single control channel to the remote media player.
//!
//! Requests are JSON-RPC 2.0 frames sent over a WebSocket and correlated with their responses by
//! numeric id. Frames carrying a `method` but no `id` are push notifications and are fanned out to
//! every handler subscribed to that method name.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("unable to connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote fault {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("session is not open (state {0:?})")]
    Closed(ConnectionState),
    #[error("malformed frame: {0}")]
    Protocol(String),
}

/// Anything that can carry a request to the remote player and hand back its result.
pub trait Rpc: Send + Sync + 'static {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RemoteError>> + Send;
}

const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub type NotificationHandler = Box<dyn Fn(&Value) -> eyre::Result<()> + Send + Sync>;

type Handlers = Arc<std::sync::RwLock<HashMap<String, Vec<NotificationHandler>>>>;
type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Value, RemoteError>>>>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("ws://{}:{}/jsonrpc", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    /// Delay to wait before the given (zero-based) attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

struct Channel {
    outgoing: mpsc::Sender<Message>,
    pending: Pending,
    closed: AtomicBool,
}

impl Channel {
    fn fail_pending(&self, state: ConnectionState) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, tx) in drained {
            let _ = tx.send(Err(RemoteError::Transport(format!(
                "channel {state:?} before response to request {id}"
            ))));
        }
    }
}

/// One established connection and the two tasks pumping its socket.
struct Link {
    channel: Arc<Channel>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

pub struct Session {
    endpoint: Endpoint,
    next_id: AtomicU64,
    generation: Arc<AtomicU64>,
    link: RwLock<Option<Link>>,
    handlers: Handlers,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl Session {
    /// Opens the control channel. The returned session is the only channel to the player.
    #[instrument(skip(host))]
    pub async fn connect(host: impl Into<String>, port: u16) -> Result<Session, RemoteError> {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let session = Session {
            endpoint: Endpoint {
                host: host.into(),
                port,
            },
            next_id: AtomicU64::new(1),
            generation: Arc::new(AtomicU64::new(0)),
            link: RwLock::new(None),
            handlers: Arc::default(),
            state_tx: Arc::new(state_tx),
        };
        session.establish().await?;
        Ok(session)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Registers a handler that runs once per matching notification for the session's lifetime,
    /// reconnects included. Handler errors and panics are logged and swallowed.
    pub fn subscribe<F>(&self, notification: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let notification = notification.into();
        debug!("Subscribing to {}", notification);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(notification)
            .or_default()
            .push(Box::new(handler));
    }

    #[instrument(skip(self, params), level = "debug")]
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(RemoteError::Closed(state));
        }
        let channel = self
            .link
            .read()
            .await
            .as_ref()
            .map(|link| link.channel.clone())
            .ok_or(RemoteError::Closed(state))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        channel
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        if channel.closed.load(Ordering::SeqCst) {
            channel
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(RemoteError::Transport(format!(
                "channel went down while issuing {method}"
            )));
        }

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!("-> {}", request);
        if channel
            .outgoing
            .send(Message::Text(request.to_string()))
            .await
            .is_err()
        {
            channel
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(RemoteError::Transport("outgoing channel closed".to_string()));
        }

        rx.await.map_err(|_| {
            RemoteError::Transport(format!("response to {method} ({id}) was dropped"))
        })?
    }

    /// Drops the current channel (if any) and dials again, waiting out the backoff between
    /// failed attempts. Subscriptions survive the reconnect.
    #[instrument(skip(self))]
    pub async fn reconnect(&self, backoff: &Backoff) -> Result<(), RemoteError> {
        self.close().await;
        let mut last_error = None;
        for attempt in 0..backoff.attempts.max(1) {
            let delay = backoff.delay_before(attempt);
            if !delay.is_zero() {
                debug!("Waiting {:?} before reconnect attempt {}", delay, attempt + 1);
                tokio::time::sleep(delay).await;
            }
            match self.establish().await {
                Ok(()) => {
                    info!("Reconnected to {} on attempt {}", self.endpoint.url(), attempt + 1);
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Reconnect attempt {} failed", attempt + 1);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(RemoteError::Closed(self.state())))
    }

    /// Tears down the current connection: pending calls fail, the reader stops dispatching and
    /// the socket is closed with a close frame.
    pub async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let link = self.link.write().await.take();
        if let Some(mut link) = link {
            link.reader.abort();
            link.channel.fail_pending(ConnectionState::Closed);
            if link.channel.outgoing.send(Message::Close(None)).await.is_err() {
                trace!("Control channel writer already gone");
            }
            if tokio::time::timeout(CLOSE_GRACE, &mut link.writer).await.is_err() {
                warn!("Control channel did not close in {:?}, dropping it", CLOSE_GRACE);
                link.writer.abort();
            }
        }
        self.state_tx.send_replace(ConnectionState::Closed);
    }

    async fn establish(&self) -> Result<(), RemoteError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(ConnectionState::Connecting);
        let url = self.endpoint.url();
        let (stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(s) => s,
            Err(source) => {
                self.state_tx.send_replace(ConnectionState::Errored);
                return Err(RemoteError::Connection {
                    endpoint: url,
                    source,
                });
            }
        };
        info!("Connected to {}", url);

        let (mut sink, mut stream) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(16);
        let channel = Arc::new(Channel {
            outgoing,
            pending: Mutex::default(),
            closed: AtomicBool::new(false),
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "Failed to write to control channel");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
            trace!("Control channel writer finished");
        });

        let reader_channel = channel.clone();
        let handlers = self.handlers.clone();
        let state_tx = self.state_tx.clone();
        let current_generation = self.generation.clone();
        let reader = tokio::spawn(async move {
            let outcome = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let live = current_generation.load(Ordering::SeqCst) == generation;
                        dispatch(&text, &reader_channel.pending, &handlers, live)
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Control channel closed by remote: {:?}", frame);
                        break ConnectionState::Closed;
                    }
                    Some(Ok(other)) => trace!("Ignoring frame {:?}", other),
                    Some(Err(e)) => {
                        warn!(error = %e, "Control channel failed");
                        break ConnectionState::Errored;
                    }
                    None => {
                        info!("Control channel ended");
                        break ConnectionState::Closed;
                    }
                }
            };
            reader_channel.fail_pending(outcome);
            if current_generation.load(Ordering::SeqCst) == generation {
                state_tx.send_replace(outcome);
            }
        });

        *self.link.write().await = Some(Link {
            channel,
            writer,
            reader,
        });
        self.state_tx.send_replace(ConnectionState::Open);
        Ok(())
    }
}

impl Rpc for Session {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        Session::call(self, method, params).await
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    error: Option<Fault>,
}

#[derive(Debug, Deserialize)]
struct Fault {
    code: i64,
    message: String,
}

#[derive(Debug)]
enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, RemoteError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

fn classify(text: &str) -> Result<Incoming, RemoteError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| RemoteError::Protocol(e.to_string()))?;
    match frame {
        Frame { id: Some(id), error: Some(fault), .. } => Ok(Incoming::Response {
            id,
            outcome: Err(RemoteError::Remote {
                code: fault.code,
                message: fault.message,
            }),
        }),
        Frame { id: Some(id), result, .. } => Ok(Incoming::Response {
            id,
            outcome: Ok(result),
        }),
        Frame { id: None, method: Some(method), params, .. } => {
            Ok(Incoming::Notification { method, params })
        }
        Frame { error: Some(fault), .. } => Err(RemoteError::Remote {
            code: fault.code,
            message: fault.message,
        }),
        _ => Err(RemoteError::Protocol(
            "frame is neither a response nor a notification".to_string(),
        )),
    }
}

/// Routes one incoming frame. Notifications from a connection that has since been replaced
/// (`live == false`) are dropped.
fn dispatch(text: &str, pending: &Pending, handlers: &Handlers, live: bool) {
    trace!("<- {}", text);
    match classify(text) {
        Ok(Incoming::Response { id, outcome }) => {
            let waiter = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => debug!("Response for unknown request {}", id),
            }
        }
        Ok(Incoming::Notification { method, .. }) if !live => {
            debug!("Dropping {} from a replaced control channel", method);
        }
        Ok(Incoming::Notification { method, params }) => {
            let handlers = handlers.read().unwrap_or_else(PoisonError::into_inner);
            let Some(subscribed) = handlers.get(&method) else {
                trace!("No handler for notification {}", method);
                return;
            };
            for handler in subscribed {
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&params))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Handler for {} failed", method),
                    Err(_) => warn!("Handler for {} panicked", method),
                }
            }
        }
        Err(e) => warn!(error = %e, "Dropping unreadable frame"),
    }
}

#[cfg(test)]
pub mod fake;
