//! Caller-side view of one generation request.
//!
//! A [`GenerationHandle`] is both the ordered stream of partial deltas and the
//! future of the final result. Callback-style callers hand it a
//! [`ResponseSink`]; stream-style callers poll it or turn it into a stream of
//! [`StreamChunk`]s.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::AbortSignal;
use crate::error::RequestError;
use crate::events::RequestId;

/// Final result of a successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub request_id: RequestId,
    pub response: String,
}

/// Items yielded by [`GenerationHandle::into_stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Partial(String),
    Done(GenerateResponse),
    Failed(RequestError),
}

/// Async callback trait for streaming responses
#[async_trait]
pub trait ResponseSink: Send {
    /// Called for each partial delta, in production order
    async fn on_partial(&mut self, delta: &str, request_id: RequestId);

    /// Called once if the request ends in an error
    async fn on_error(&mut self, message: &str, request_id: RequestId);
}

/// Sink that records everything it receives.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    pub partials: Vec<String>,
    pub errors: Vec<String>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.partials.concat()
    }
}

#[async_trait]
impl ResponseSink for CollectingSink {
    async fn on_partial(&mut self, delta: &str, _request_id: RequestId) {
        self.partials.push(delta.to_string());
    }

    async fn on_error(&mut self, message: &str, _request_id: RequestId) {
        self.errors.push(message.to_string());
    }
}

/// Sink built from two closures, mirroring the `onPartial` / `onError` pair.
pub struct CallbackSink<P, E> {
    on_partial: P,
    on_error: E,
}

impl<P, E> CallbackSink<P, E>
where
    P: FnMut(&str, RequestId) + Send,
    E: FnMut(&str, RequestId) + Send,
{
    pub fn new(on_partial: P, on_error: E) -> Self {
        Self { on_partial, on_error }
    }
}

#[async_trait]
impl<P, E> ResponseSink for CallbackSink<P, E>
where
    P: FnMut(&str, RequestId) + Send,
    E: FnMut(&str, RequestId) + Send,
{
    async fn on_partial(&mut self, delta: &str, request_id: RequestId) {
        (self.on_partial)(delta, request_id)
    }

    async fn on_error(&mut self, message: &str, request_id: RequestId) {
        (self.on_error)(message, request_id)
    }
}

/// Cloneable cancellation signal for one request.
#[derive(Clone)]
pub struct CancelHandle {
    request_id: RequestId,
    signal: Arc<AbortSignal>,
}

impl CancelHandle {
    pub(crate) fn new(request_id: RequestId, signal: Arc<AbortSignal>) -> Self {
        Self { request_id, signal }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Stop the request. Has no effect once it reached a terminal state.
    pub fn cancel(&self) {
        self.signal.abort(RequestError::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_aborted()
    }
}

/// A submitted generation request.
///
/// Partial deltas end when the request reaches its terminal state; the outcome
/// is then available through [`finish`](Self::finish).
pub struct GenerationHandle {
    request_id: RequestId,
    partials: mpsc::UnboundedReceiver<String>,
    outcome: oneshot::Receiver<Result<GenerateResponse, RequestError>>,
    cancel: CancelHandle,
}

impl GenerationHandle {
    pub(crate) fn new(
        request_id: RequestId,
        partials: mpsc::UnboundedReceiver<String>,
        outcome: oneshot::Receiver<Result<GenerateResponse, RequestError>>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            request_id,
            partials,
            outcome,
            cancel,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Next partial delta, or `None` once the request is terminal.
    pub async fn next_partial(&mut self) -> Option<String> {
        self.partials.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the terminal outcome, discarding undelivered partials.
    pub async fn finish(self) -> Result<GenerateResponse, RequestError> {
        let Self { partials, outcome, .. } = self;
        drop(partials);
        outcome.await.unwrap_or(Err(RequestError::Closed))
    }

    /// Feed every partial to `sink`, report a failure to it, and return the outcome.
    pub async fn drive<S>(mut self, sink: &mut S) -> Result<GenerateResponse, RequestError>
    where
        S: ResponseSink + ?Sized,
    {
        while let Some(delta) = self.partials.recv().await {
            sink.on_partial(&delta, self.request_id).await;
        }

        let request_id = self.request_id;
        let result = self.finish().await;
        if let Err(e) = &result {
            sink.on_error(&e.to_string(), request_id).await;
        }
        result
    }

    /// Partials followed by exactly one `Done` or `Failed` chunk.
    pub fn into_stream(self) -> impl Stream<Item = StreamChunk> + Send {
        async_stream::stream! {
            let mut handle = self;
            while let Some(delta) = handle.partials.recv().await {
                yield StreamChunk::Partial(delta);
            }
            match handle.finish().await {
                Ok(response) => yield StreamChunk::Done(response),
                Err(e) => yield StreamChunk::Failed(e),
            }
        }
    }
}

impl Stream for GenerationHandle {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.partials.poll_recv(cx)
    }
}
