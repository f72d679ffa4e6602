//! Error types for the llmstream bridge.
//!
//! Errors are split by concern: the backend contract, engine lifecycle,
//! session lifecycle, individual generation requests and configuration.
//! Every error maps to a stable string code used on the RPC surface.

use std::path::PathBuf;
use std::result;
use std::time::Duration;

use thiserror::Error;

/// A specialized Result type for bridge operations.
pub type Result<T> = result::Result<T, Error>;

/// Failure reported by an inference backend implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),

    #[error("unsupported accelerator: {0}")]
    UnsupportedAccelerator(String),
}

impl BackendError {
    pub fn msg(message: impl Into<String>) -> Self {
        BackendError::Message(message.into())
    }
}

/// Engine lifecycle errors (`createModel`, `closeEngine`).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Model file not found at {}", path.display())]
    AssetMissing { path: PathBuf },

    #[error("Model creation failed: {0}")]
    InitFailure(String),

    #[error("Engine close failed: {0}")]
    CloseFailed(String),

    #[error("LLM model is not initialized")]
    NotReady,

    #[error("Engine worker shut down unexpectedly")]
    WorkerShutdown,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Session lifecycle errors (`resetSession`, `closeSession`).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session close failed: {0}")]
    CloseFailed(String),

    #[error("Session creation failed: {0}")]
    BuildFailed(String),

    #[error("LLM model is not initialized")]
    NotReady,

    #[error("Engine worker shut down unexpectedly")]
    WorkerShutdown,
}

/// Errors scoped to a single generation request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("LLM model is not initialized")]
    NotReady,

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Session closed while request was in flight")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine worker shut down unexpectedly")]
    WorkerShutdown,
}

/// Configuration loading and validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid engine configuration: {0}")]
    Invalid(String),

    #[error("Configuration error: {0}")]
    Load(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Crate-level error aggregating every concern.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.into())
    }
}

/// Stable error codes exposed on the RPC surface.
pub mod codes {
    pub const NO_MODEL: &str = "E_NO_MODEL";
    pub const MODEL_CREATION: &str = "E_MODEL_CREATION";
    pub const ASSET_MISSING: &str = "E_ASSET_MISSING";
    pub const INFERENCE: &str = "E_INFERENCE";
    pub const CANCELLED: &str = "E_CANCELLED";
    pub const CLOSED: &str = "E_CLOSED";
    pub const TIMEOUT: &str = "E_TIMEOUT";
    pub const CLOSE_FAILED: &str = "E_CLOSE_FAILED";
    pub const WORKER: &str = "E_WORKER";
    pub const CONFIG: &str = "E_CONFIG";
    pub const INVALID_ARGUMENT: &str = "E_INVALID_ARGUMENT";
    pub const UNKNOWN_METHOD: &str = "E_UNKNOWN_METHOD";
    pub const INTERNAL: &str = "E_INTERNAL";
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::AssetMissing { .. } => codes::ASSET_MISSING,
            EngineError::InitFailure(_) => codes::MODEL_CREATION,
            EngineError::CloseFailed(_) => codes::CLOSE_FAILED,
            EngineError::NotReady => codes::NO_MODEL,
            EngineError::WorkerShutdown => codes::WORKER,
            EngineError::Session(err) => err.code(),
        }
    }
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::CloseFailed(_) => codes::CLOSE_FAILED,
            SessionError::BuildFailed(_) => codes::MODEL_CREATION,
            SessionError::NotReady => codes::NO_MODEL,
            SessionError::WorkerShutdown => codes::WORKER,
        }
    }
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::NotReady => codes::NO_MODEL,
            RequestError::Generation(_) => codes::INFERENCE,
            RequestError::Cancelled => codes::CANCELLED,
            RequestError::Closed => codes::CLOSED,
            RequestError::Timeout(_) => codes::TIMEOUT,
            RequestError::WorkerShutdown => codes::WORKER,
        }
    }

    /// Whether the failure originated inside the engine rather than the bridge.
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, RequestError::Generation(_))
    }
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Engine(err) => err.code(),
            Error::Session(err) => err.code(),
            Error::Request(err) => err.code(),
            Error::Config(_) => codes::CONFIG,
            Error::Io(_) | Error::Serialization(_) => codes::INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RequestError::NotReady.code(), "E_NO_MODEL");
        assert_eq!(EngineError::NotReady.code(), "E_NO_MODEL");
        assert_eq!(RequestError::Generation("boom".into()).code(), "E_INFERENCE");
        assert_eq!(
            EngineError::AssetMissing { path: PathBuf::from("/tmp/x.task") }.code(),
            "E_ASSET_MISSING"
        );
        assert_eq!(
            EngineError::from(SessionError::CloseFailed("x".into())).code(),
            "E_CLOSE_FAILED"
        );
    }

    #[test]
    fn test_error_messages() {
        let err = EngineError::AssetMissing { path: PathBuf::from("/data/model.task") };
        assert_eq!(err.to_string(), "Model file not found at /data/model.task");

        let err = RequestError::Generation("out of memory".into());
        assert_eq!(err.to_string(), "Generation failed: out of memory");

        let err: Error = RequestError::Cancelled.into();
        assert_eq!(err.to_string(), "Request cancelled");
        assert_eq!(err.code(), "E_CANCELLED");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "io error");
        let converted: Error = io_err.into();
        assert!(matches!(converted, Error::Io(_)));

        let config_err = config::ConfigError::NotFound("key".to_string());
        let converted: Error = config_err.into();
        assert!(matches!(converted, Error::Config(ConfigError::Load(_))));
    }
}
