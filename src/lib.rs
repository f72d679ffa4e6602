pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod router;
pub mod rpc;

// Re-export commonly used types
pub use config::{Accelerator, EngineConfig, Settings};
pub use engine::{InferenceBackend, ScriptedBackend};
pub use error::{EngineError, Error, RequestError, Result, SessionError};
pub use events::{BridgeEvent, EventBus, EventKind, RequestId};
pub use manager::{Ack, LifecycleState, SessionManager};
pub use router::{GenerateOptions, GenerateResponse, GenerationHandle, StreamChunk};
pub use rpc::{NativeBridge, Rejection, RpcCall, RpcReply};
