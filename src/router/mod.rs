//! Request router.
//!
//! Turns one prompt into a uniquely identified unit of streaming work. Requests
//! are queued FIFO and dispatched one at a time by a single task, which
//! subscribes to the event bus before handing the prompt to the engine worker
//! and then relays that request's events, and only those, to its handle.
//!
//! Each request also gets a watcher task. It runs the request's deadline from
//! the moment of submission and settles requests that are cancelled or time
//! out while still queued, so they never wait on the request ahead of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::GenerationPort;
use crate::error::RequestError;
use crate::events::{BridgeEvent, EventBus, RequestId};

pub mod handle;

pub use handle::{
    CallbackSink, CancelHandle, CollectingSink, GenerateResponse, GenerationHandle,
    ResponseSink, StreamChunk,
};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Mint a process-wide unique request id.
pub fn next_request_id() -> RequestId {
    RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

/// Request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Pending,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Errored | RequestState::Cancelled
        )
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Overrides the router's default request timeout
    pub timeout: Option<Duration>,
}

impl GenerateOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Router statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterStats {
    pub submitted: u64,
    pub completed: u64,
    pub errored: u64,
    pub cancelled: u64,
    pub timed_out: u64,
}

/// Cancellation token plus the error the request should fail with.
pub(crate) struct AbortSignal {
    token: CancellationToken,
    reason: Mutex<Option<RequestError>>,
    /// Cancelled once the request has its outcome
    settled: CancellationToken,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            settled: CancellationToken::new(),
        }
    }

    /// The first reason wins.
    pub(crate) fn abort(&self, reason: RequestError) {
        {
            let mut current = self.reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    fn reason(&self) -> RequestError {
        self.reason.lock().clone().unwrap_or(RequestError::Cancelled)
    }
}

type Outcome = Result<GenerateResponse, RequestError>;

struct RequestRecord {
    state: RequestState,
    accumulated: String,
    signal: Arc<AbortSignal>,
    partial_tx: mpsc::UnboundedSender<String>,
    outcome_tx: oneshot::Sender<Outcome>,
    submitted_at: DateTime<Utc>,
}

struct Job {
    request_id: RequestId,
    prompt: String,
    signal: Arc<AbortSignal>,
}

struct RouterInner {
    bus: EventBus,
    requests: Mutex<HashMap<RequestId, RequestRecord>>,
    port: RwLock<Option<GenerationPort>>,
    default_timeout: Option<Duration>,
    stats: Mutex<RouterStats>,
    drained: Notify,
}

/// FIFO request router over a single engine session.
pub struct RequestRouter {
    inner: Arc<RouterInner>,
    queue_tx: mpsc::UnboundedSender<Job>,
}

impl RequestRouter {
    /// Create a router and start its dispatcher. Requires a tokio runtime.
    pub fn new(bus: EventBus, default_timeout: Option<Duration>) -> Self {
        let inner = Arc::new(RouterInner {
            bus,
            requests: Mutex::new(HashMap::new()),
            port: RwLock::new(None),
            default_timeout,
            stats: Mutex::new(RouterStats::default()),
            drained: Notify::new(),
        });

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(Arc::clone(&inner), queue_rx));

        Self { inner, queue_tx }
    }

    /// Hand the router a port to the current engine worker.
    pub fn attach(&self, port: GenerationPort) {
        *self.inner.port.write() = Some(port);
        debug!("Router attached to engine worker");
    }

    pub fn detach(&self) {
        if self.inner.port.write().take().is_some() {
            debug!("Router detached from engine worker");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.port.read().is_some()
    }

    /// Queue `prompt` for generation.
    pub fn submit(
        &self,
        prompt: impl Into<String>,
        options: GenerateOptions,
    ) -> Result<GenerationHandle, RequestError> {
        let request_id = next_request_id();
        let signal = Arc::new(AbortSignal::new());
        let (partial_tx, partial_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        self.inner.requests.lock().insert(
            request_id,
            RequestRecord {
                state: RequestState::Pending,
                accumulated: String::new(),
                signal: Arc::clone(&signal),
                partial_tx,
                outcome_tx,
                submitted_at: Utc::now(),
            },
        );

        let job = Job {
            request_id,
            prompt: prompt.into(),
            signal: Arc::clone(&signal),
        };
        if self.queue_tx.send(job).is_err() {
            self.inner.requests.lock().remove(&request_id);
            return Err(RequestError::Closed);
        }

        let timeout = options.timeout.or(self.inner.default_timeout);
        tokio::spawn(watch_request(
            Arc::clone(&self.inner),
            request_id,
            Arc::clone(&signal),
            timeout,
        ));

        self.inner.stats.lock().submitted += 1;
        debug!("Queued request {}", request_id);

        Ok(GenerationHandle::new(
            request_id,
            partial_rx,
            outcome_rx,
            CancelHandle::new(request_id, signal),
        ))
    }

    /// Cancel one request. Returns false if it is unknown or already terminal.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let signal = self
            .inner
            .requests
            .lock()
            .get(&request_id)
            .map(|record| Arc::clone(&record.signal));
        match signal {
            Some(signal) => {
                signal.abort(RequestError::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Fail every queued and in-flight request with `reason`, and wait until
    /// the router holds no requests.
    pub async fn abort_all(&self, reason: RequestError) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let requests = self.inner.requests.lock();
                if requests.is_empty() {
                    return;
                }
                info!("Aborting {} requests: {}", requests.len(), reason);
                for record in requests.values() {
                    record.signal.abort(reason.clone());
                }
            }

            notified.await;
        }
    }

    /// Requests not yet terminal, queued or streaming.
    pub fn pending(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// State of a live request. Records are removed at their terminal state.
    pub fn request_state(&self, request_id: RequestId) -> Option<RequestState> {
        self.inner
            .requests
            .lock()
            .get(&request_id)
            .map(|record| record.state)
    }

    pub fn stats(&self) -> RouterStats {
        self.inner.stats.lock().clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }
}

async fn dispatch(inner: Arc<RouterInner>, mut queue_rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = queue_rx.recv().await {
        inner.run(job).await;
    }
    debug!("Router dispatcher stopped");
}

/// Run the request deadline from submission and settle a request that is
/// aborted before the dispatcher reaches it.
async fn watch_request(
    inner: Arc<RouterInner>,
    request_id: RequestId,
    signal: Arc<AbortSignal>,
    timeout: Option<Duration>,
) {
    let expired = async move {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;

        _ = signal.settled.cancelled() => return,
        _ = signal.token.cancelled() => {}
        _ = expired => signal.abort(RequestError::Timeout(timeout.unwrap_or_default())),
    }

    // In-flight requests are settled by the dispatcher
    inner.settle_if_pending(request_id, signal.reason());
}

impl RouterInner {
    async fn run(&self, job: Job) {
        let Job {
            request_id,
            prompt,
            signal,
        } = job;

        if !self.claim(request_id) {
            debug!("Request {} settled while queued", request_id);
            return;
        }

        let result = self.execute(request_id, prompt, &signal).await;
        self.settle(request_id, result);
    }

    /// Move a queued request to `Streaming`. False if it already settled.
    fn claim(&self, request_id: RequestId) -> bool {
        match self.requests.lock().get_mut(&request_id) {
            Some(record) if record.state == RequestState::Pending => {
                record.state = RequestState::Streaming;
                true
            }
            _ => false,
        }
    }

    async fn execute(
        &self,
        request_id: RequestId,
        prompt: String,
        signal: &AbortSignal,
    ) -> Outcome {
        if signal.is_aborted() {
            return Err(signal.reason());
        }
        let port = self.port.read().clone().ok_or(RequestError::Closed)?;

        // Subscribe before submitting so no event can be missed
        let mut subscription = self.bus.subscribe(request_id);
        port.submit(request_id, prompt, signal.token.clone())?;

        loop {
            tokio::select! {
                biased;

                _ = signal.token.cancelled() => return Err(signal.reason()),

                event = subscription.recv() => match event {
                    Some(BridgeEvent::Partial { partial, .. }) => {
                        self.forward_partial(request_id, &partial);
                        self.bus.emit(BridgeEvent::Partial { request_id, partial });
                    }
                    Some(BridgeEvent::Error { error, .. }) => {
                        self.bus.emit(BridgeEvent::Error {
                            request_id,
                            error: error.clone(),
                        });
                        return Err(RequestError::Generation(error));
                    }
                    Some(BridgeEvent::Complete { response, .. }) => {
                        let accumulated = self.take_accumulated(request_id);
                        if accumulated != response {
                            debug!(
                                "Request {} response differs from streamed partials",
                                request_id
                            );
                        }
                        self.bus.emit(BridgeEvent::Complete {
                            request_id,
                            response: accumulated.clone(),
                        });
                        return Ok(GenerateResponse {
                            request_id,
                            response: accumulated,
                        });
                    }
                    Some(BridgeEvent::Logging { .. }) => {}
                    None => return Err(RequestError::WorkerShutdown),
                },

                _ = port.closed() => return Err(RequestError::WorkerShutdown),
            }
        }
    }

    fn settle_if_pending(&self, request_id: RequestId, error: RequestError) {
        let record = {
            let mut requests = self.requests.lock();
            match requests.get(&request_id) {
                Some(record) if record.state == RequestState::Pending => requests.remove(&request_id),
                _ => None,
            }
        };
        if let Some(record) = record {
            self.finish(request_id, record, Err(error));
        }
    }

    /// Deliver the outcome of a request. The first settlement wins.
    fn settle(&self, request_id: RequestId, result: Outcome) {
        let record = self.requests.lock().remove(&request_id);
        match record {
            Some(record) => self.finish(request_id, record, result),
            None => debug!("Request {} already settled", request_id),
        }
    }

    fn finish(&self, request_id: RequestId, record: RequestRecord, result: Outcome) {
        let RequestRecord {
            signal,
            partial_tx,
            outcome_tx,
            submitted_at,
            ..
        } = record;
        drop(partial_tx);

        let state = match &result {
            Ok(_) => RequestState::Completed,
            Err(RequestError::Generation(_)) | Err(RequestError::WorkerShutdown) => {
                RequestState::Errored
            }
            Err(_) => RequestState::Cancelled,
        };

        // Engine errors were already emitted as they were delivered
        if let Err(e) = &result {
            if !e.is_engine_failure() {
                self.bus.emit(BridgeEvent::Error {
                    request_id,
                    error: e.to_string(),
                });
            }
        }

        {
            let mut stats = self.stats.lock();
            match &result {
                Ok(_) => stats.completed += 1,
                Err(RequestError::Generation(_)) | Err(RequestError::WorkerShutdown) => {
                    stats.errored += 1
                }
                Err(RequestError::Timeout(_)) => stats.timed_out += 1,
                Err(_) => stats.cancelled += 1,
            }
        }

        let elapsed = Utc::now() - submitted_at;
        match &result {
            Ok(_) => info!(
                "Request {} {:?} in {}ms",
                request_id,
                state,
                elapsed.num_milliseconds()
            ),
            Err(e) => warn!(
                "Request {} {:?} after {}ms: {}",
                request_id,
                state,
                elapsed.num_milliseconds(),
                e
            ),
        }

        signal.settled.cancel();
        if outcome_tx.send(result).is_err() {
            debug!("Handle for request {} was dropped", request_id);
        }
        self.drained.notify_waiters();
    }

    fn forward_partial(&self, request_id: RequestId, delta: &str) {
        if let Some(record) = self.requests.lock().get_mut(&request_id) {
            record.accumulated.push_str(delta);
            let _ = record.partial_tx.send(delta.to_string());
        }
    }

    fn take_accumulated(&self, request_id: RequestId) -> String {
        self.requests
            .lock()
            .get_mut(&request_id)
            .map(|record| std::mem::take(&mut record.accumulated))
            .unwrap_or_default()
    }
}
