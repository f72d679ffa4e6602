//! Session: conversational context derived from an engine handle.

use tracing::{debug, warn};

use super::{ContinueGeneration, EngineHandle, FinishReason, InferenceSession, SessionOptions};
use crate::error::{BackendError, SessionError};

/// A stateful conversation bound to one engine handle.
///
/// Generation takes `&mut self`, so at most one generation can run at a time.
pub struct Session {
    inner: Option<Box<dyn InferenceSession>>,
    options: SessionOptions,
    turns: u64,
}

impl Session {
    /// Build a session on `engine` with the given sampling parameters.
    pub fn build(engine: &mut EngineHandle, options: SessionOptions) -> Result<Self, SessionError> {
        let inner = engine.create_session(&options)?;
        Ok(Self {
            inner: Some(inner),
            options,
            turns: 0,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Completed generations since the session was built.
    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Submit `prompt` and stream the response through `on_token`.
    pub fn generate(
        &mut self,
        prompt: &str,
        on_token: &mut dyn FnMut(&str) -> ContinueGeneration,
    ) -> Result<FinishReason, BackendError> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| BackendError::msg("session is closed"))?;

        inner.add_query_chunk(prompt)?;
        let reason = inner.generate(on_token)?;
        self.turns += 1;
        debug!("Session turn {} finished: {:?}", self.turns, reason);
        Ok(reason)
    }

    /// Release the backend session. The reference is dropped even on failure.
    pub fn close(&mut self) -> Result<(), SessionError> {
        match self.inner.take() {
            Some(mut inner) => inner.close().map_err(|e| {
                warn!("Session close failed: {}", e);
                SessionError::CloseFailed(e.to_string())
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.inner.is_some() {
            if let Err(e) = self.close() {
                warn!("Session dropped without clean close: {}", e);
            }
        }
    }
}
