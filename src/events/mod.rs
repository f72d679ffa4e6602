//! Event channel between the engine worker and the request router.
//!
//! Producers call [`EventBus::publish`]; per-request events are routed to the
//! one [`Subscription`] registered for that request id and dropped when none
//! is registered. The router re-emits what it actually delivered through
//! [`EventBus::emit`], so listeners see each request's stream exactly once and
//! in production order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace, warn};

const DEFAULT_LISTENER_CAPACITY: usize = 1024;

/// Unique identifier of a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notifications carried from the session to the router and to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BridgeEvent {
    #[serde(rename = "onPartialResponse", rename_all = "camelCase")]
    Partial { request_id: RequestId, partial: String },

    #[serde(rename = "onErrorResponse", rename_all = "camelCase")]
    Error { request_id: RequestId, error: String },

    #[serde(rename = "onCompleteResponse", rename_all = "camelCase")]
    Complete { request_id: RequestId, response: String },

    #[serde(rename = "logging")]
    Logging { message: String },
}

impl BridgeEvent {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            BridgeEvent::Partial { request_id, .. }
            | BridgeEvent::Error { request_id, .. }
            | BridgeEvent::Complete { request_id, .. } => Some(*request_id),
            BridgeEvent::Logging { .. } => None,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::Partial { .. } => EventKind::PartialResponse,
            BridgeEvent::Error { .. } => EventKind::ErrorResponse,
            BridgeEvent::Complete { .. } => EventKind::CompleteResponse,
            BridgeEvent::Logging { .. } => EventKind::Logging,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeEvent::Error { .. } | BridgeEvent::Complete { .. })
    }
}

/// Event names as seen by emitter listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PartialResponse,
    ErrorResponse,
    CompleteResponse,
    Logging,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PartialResponse => "onPartialResponse",
            EventKind::ErrorResponse => "onErrorResponse",
            EventKind::CompleteResponse => "onCompleteResponse",
            EventKind::Logging => "logging",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "onPartialResponse" => Some(EventKind::PartialResponse),
            "onErrorResponse" => Some(EventKind::ErrorResponse),
            "onCompleteResponse" => Some(EventKind::CompleteResponse),
            "logging" => Some(EventKind::Logging),
            _ => None,
        }
    }
}

struct BusInner {
    subscriptions: Mutex<HashMap<RequestId, mpsc::UnboundedSender<BridgeEvent>>>,
    listeners: broadcast::Sender<BridgeEvent>,
}

impl BusInner {
    fn unregister(&self, request_id: RequestId) {
        if self.subscriptions.lock().remove(&request_id).is_some() {
            trace!("Unregistered subscription for request {}", request_id);
        }
    }
}

/// Injected event bus instance. Clones share the same registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_listener_capacity(DEFAULT_LISTENER_CAPACITY)
    }

    /// Bus whose listeners may lag by at most `capacity` events.
    pub fn with_listener_capacity(capacity: usize) -> Self {
        let (listeners, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                subscriptions: Mutex::new(HashMap::new()),
                listeners,
            }),
        }
    }

    /// Register the sink for `request_id`. Dropping the guard unregisters it.
    pub fn subscribe(&self, request_id: RequestId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.subscriptions.lock().insert(request_id, tx).is_some() {
            warn!("Replaced existing subscription for request {}", request_id);
        }
        trace!("Registered subscription for request {}", request_id);
        Subscription {
            request_id,
            rx,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Producer side. Returns whether a per-request event reached a subscriber.
    pub fn publish(&self, event: BridgeEvent) -> bool {
        let Some(request_id) = event.request_id() else {
            self.emit(event);
            return true;
        };

        let sender = self.inner.subscriptions.lock().get(&request_id).cloned();
        match sender {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!(
                    "Discarding {} for unsubscribed request {}",
                    event.kind().name(),
                    request_id
                );
                false
            }
        }
    }

    /// Fan an event out to every listener.
    pub fn emit(&self, event: BridgeEvent) {
        // No listeners is not an error
        let _ = self.inner.listeners.send(event);
    }

    /// Listen to every emitted event, or only those of `kind`.
    pub fn add_listener(&self, kind: Option<EventKind>) -> EventListener {
        EventListener {
            kind,
            rx: self.inner.listeners.subscribe(),
        }
    }

    /// Emitter-contract hook; listeners are released by dropping them.
    pub fn remove_listeners(&self, count: usize) {
        debug!(
            "remove_listeners({}) requested, {} listeners attached",
            count,
            self.listener_count()
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.receiver_count()
    }
}

/// Per-request event registration.
///
/// Events arrive in the order they were published. The registration is removed
/// when the guard is dropped, whatever the exit path.
pub struct Subscription {
    request_id: RequestId,
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
    bus: Arc<BusInner>,
}

impl Subscription {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(self.request_id);
    }
}

/// Filtered view over emitted events.
pub struct EventListener {
    kind: Option<EventKind>,
    rx: broadcast::Receiver<BridgeEvent>,
}

impl EventListener {
    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }

    /// Next matching event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event listener lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = BridgeEvent> + Send + Unpin {
        let kind = self.kind;
        BroadcastStream::new(self.rx).filter_map(move |item| match item {
            Ok(event) if kind.map_or(true, |k| event.kind() == k) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Event stream lagged, skipped {} events", skipped);
                None
            }
        })
    }

    fn matches(&self, event: &BridgeEvent) -> bool {
        self.kind.map_or(true, |k| event.kind() == k)
    }
}
