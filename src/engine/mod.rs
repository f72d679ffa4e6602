//! Engine abstraction layer.
//!
//! The generative engine is opaque to the bridge: it is reached only through
//! [`InferenceBackend`], [`LoadedModel`] and [`InferenceSession`]. Loaded models
//! and sessions live on the dedicated engine worker thread, so only the backend
//! factory has to be shareable across threads.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, DEFAULT_TOP_P};
use crate::error::BackendError;

pub mod handle;
pub mod scripted;
pub mod session;
pub mod worker;

pub use handle::EngineHandle;
pub use scripted::ScriptedBackend;
pub use session::Session;
pub use worker::{EngineWorker, GenerationPort};

/// Factory for loaded models. Implemented once per inference runtime.
pub trait InferenceBackend: Send + Sync + 'static {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Load model weights from `asset` and build the compute context.
    fn load(&self, asset: &Path, config: &EngineConfig)
        -> Result<Box<dyn LoadedModel>, BackendError>;
}

/// Loaded weights plus compute context.
pub trait LoadedModel {
    fn create_session(
        &mut self,
        options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, BackendError>;

    fn close(&mut self) -> Result<(), BackendError>;
}

/// Stateful conversational context derived from a loaded model.
pub trait InferenceSession {
    /// Append prompt text to the conversation.
    fn add_query_chunk(&mut self, text: &str) -> Result<(), BackendError>;

    /// Generate a response for the accumulated query, emitting each text delta.
    ///
    /// The callback's return value lets the caller stop generation at the next
    /// token boundary; the session must be reusable afterwards.
    fn generate(
        &mut self,
        on_token: &mut dyn FnMut(&str) -> ContinueGeneration,
    ) -> Result<FinishReason, BackendError>;

    fn close(&mut self) -> Result<(), BackendError>;
}

/// Control flow for generation continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueGeneration {
    /// Continue generating tokens
    Continue,
    /// Stop generation at the next token boundary
    Stop,
}

/// Reason why generation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    EndOfSequence,
    MaxTokens,
    Stopped,
}

/// Sampling parameters applied to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub max_tokens: u32,
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub random_seed: i64,
}

impl SessionOptions {
    pub fn from_config(config: &EngineConfig, top_p: f32) -> Self {
        Self {
            max_tokens: config.max_tokens,
            top_k: config.top_k,
            top_p,
            temperature: config.temperature,
            random_seed: config.random_seed,
        }
    }
}

impl From<&EngineConfig> for SessionOptions {
    fn from(config: &EngineConfig) -> Self {
        Self::from_config(config, DEFAULT_TOP_P)
    }
}
