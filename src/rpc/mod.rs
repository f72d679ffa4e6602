//! Bridge surface exposed across the UI/runtime boundary.
//!
//! [`NativeBridge`] mirrors the native module contract: acknowledgement
//! strings, boolean close results, `{requestId, response}` payloads, string
//! error codes and the emitter hooks. [`NativeBridge::handle_call`] dispatches
//! JSON-encoded calls for transports such as the stdio bridge.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{Accelerator, EngineConfig};
use crate::error::{codes, ConfigError, EngineError, RequestError, SessionError};
use crate::events::{BridgeEvent, EventKind, EventListener, RequestId};
use crate::manager::SessionManager;
use crate::router::{GenerateOptions, GenerateResponse};

/// Promise rejection: a stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Rejection {
    pub code: String,
    pub message: String,
}

impl Rejection {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<EngineError> for Rejection {
    fn from(err: EngineError) -> Self {
        Rejection::new(err.code(), err.to_string())
    }
}

impl From<SessionError> for Rejection {
    fn from(err: SessionError) -> Self {
        Rejection::new(err.code(), err.to_string())
    }
}

impl From<RequestError> for Rejection {
    fn from(err: RequestError) -> Self {
        Rejection::new(err.code(), err.to_string())
    }
}

impl From<ConfigError> for Rejection {
    fn from(err: ConfigError) -> Self {
        Rejection::new(codes::MODEL_CREATION, err.to_string())
    }
}

/// One JSON-encoded call: `{"id":1,"method":"createModel","params":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    #[serde(default)]
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Reply to an [`RpcCall`]; exactly one of `result` or `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Rejection>,
}

impl RpcReply {
    fn from_result<T: Serialize>(id: u64, result: Result<T, Rejection>) -> Self {
        match result.and_then(|value| {
            serde_json::to_value(value).map_err(|e| Rejection::new(codes::INTERNAL, e.to_string()))
        }) {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(rejection) => Self {
                id,
                result: None,
                error: Some(rejection),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateModelParams {
    max_tokens: u32,
    top_k: u32,
    temperature: f32,
    #[serde(default)]
    random_seed: i64,
    #[serde(default = "default_accelerator")]
    accelerator: String,
}

fn default_accelerator() -> String {
    Accelerator::default().to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateParams {
    /// Caller-chosen ids are not trusted; the router mints its own.
    #[serde(default)]
    request_id: Option<u64>,
    prompt: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelParams {
    request_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddListenerParams {
    event_name: String,
}

#[derive(Debug, Deserialize)]
struct RemoveListenersParams {
    count: usize,
}

/// Native-module style facade over a [`SessionManager`].
#[derive(Clone)]
pub struct NativeBridge {
    manager: Arc<SessionManager>,
}

impl NativeBridge {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Resolves with an acknowledgement string; idempotent once created.
    pub async fn create_model(
        &self,
        max_tokens: u32,
        top_k: u32,
        temperature: f32,
        random_seed: i64,
        accelerator: &str,
    ) -> Result<String, Rejection> {
        let config = EngineConfig {
            max_tokens,
            top_k,
            temperature,
            random_seed,
            accelerator: accelerator.parse()?,
        };
        config.validate()?;

        let ack = self.manager.create_model(config).await?;
        Ok(ack.to_string())
    }

    pub async fn close_session(&self) -> Result<bool, Rejection> {
        self.manager.close_session().await?;
        Ok(true)
    }

    pub async fn close_engine(&self) -> Result<bool, Rejection> {
        self.manager.close_engine().await?;
        Ok(true)
    }

    pub async fn reset_session(&self) -> Result<String, Rejection> {
        let ack = self.manager.reset_session().await?;
        Ok(ack.to_string())
    }

    pub async fn generate_response(&self, prompt: &str) -> Result<GenerateResponse, Rejection> {
        self.generate_response_with(prompt, GenerateOptions::default()).await
    }

    pub async fn generate_response_with(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<GenerateResponse, Rejection> {
        let handle = self.manager.generate_with_options(prompt, options)?;
        Ok(handle.finish().await?)
    }

    /// Stop an in-flight or queued generation.
    pub fn cancel_generate_response(&self, request_id: u64) -> bool {
        self.manager.cancel(RequestId(request_id))
    }

    pub fn add_listener(&self, event_name: &str) -> Result<EventListener, Rejection> {
        let kind = EventKind::from_name(event_name).ok_or_else(|| {
            Rejection::new(
                codes::INVALID_ARGUMENT,
                format!("unknown event '{}'", event_name),
            )
        })?;
        Ok(self.manager.events().add_listener(Some(kind)))
    }

    pub fn remove_listeners(&self, count: usize) {
        self.manager.events().remove_listeners(count);
    }

    /// Every emitted event, in emission order.
    pub fn events(&self) -> impl Stream<Item = BridgeEvent> + Send + Unpin {
        self.manager.events().add_listener(None).into_stream()
    }

    /// Dispatch one JSON-encoded call.
    pub async fn handle_call(&self, call: RpcCall) -> RpcReply {
        debug!("RPC call {} {}", call.id, call.method);
        let id = call.id;

        match call.method.as_str() {
            "createModel" => {
                let result = match parse_params::<CreateModelParams>(call.params) {
                    Ok(p) => {
                        self.create_model(
                            p.max_tokens,
                            p.top_k,
                            p.temperature,
                            p.random_seed,
                            &p.accelerator,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                RpcReply::from_result(id, result)
            }
            "closeSession" => RpcReply::from_result(id, self.close_session().await),
            "closeEngine" => RpcReply::from_result(id, self.close_engine().await),
            "resetSession" => RpcReply::from_result(id, self.reset_session().await),
            "generateResponse" => {
                let result = match parse_params::<GenerateParams>(call.params) {
                    Ok(p) => {
                        if let Some(caller_id) = p.request_id {
                            debug!("Ignoring caller request id {}", caller_id);
                        }
                        let options = GenerateOptions {
                            timeout: p.timeout_ms.map(Duration::from_millis),
                        };
                        self.generate_response_with(&p.prompt, options).await
                    }
                    Err(e) => Err(e),
                };
                RpcReply::from_result(id, result)
            }
            "cancelGenerateResponse" => {
                let result = parse_params::<CancelParams>(call.params)
                    .map(|p| self.cancel_generate_response(p.request_id));
                RpcReply::from_result(id, result)
            }
            "addListener" => {
                // The transport forwards every event; registration only validates the name
                let result = parse_params::<AddListenerParams>(call.params).and_then(|p| {
                    EventKind::from_name(&p.event_name).map(|_| Value::Null).ok_or_else(|| {
                        Rejection::new(
                            codes::INVALID_ARGUMENT,
                            format!("unknown event '{}'", p.event_name),
                        )
                    })
                });
                RpcReply::from_result(id, result)
            }
            "removeListeners" => {
                let result = parse_params::<RemoveListenersParams>(call.params).map(|p| {
                    self.remove_listeners(p.count);
                    Value::Null
                });
                RpcReply::from_result(id, result)
            }
            other => {
                warn!("Unknown RPC method: {}", other);
                RpcReply::from_result::<Value>(
                    id,
                    Err(Rejection::new(
                        codes::UNKNOWN_METHOD,
                        format!("unknown method '{}'", other),
                    )),
                )
            }
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, Rejection> {
    serde_json::from_value(params).map_err(|e| Rejection::new(codes::INVALID_ARGUMENT, e.to_string()))
}
