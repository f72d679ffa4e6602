//! Dedicated engine worker.
//!
//! The engine handle and its session are created, used and released on one
//! OS thread. Callers talk to it through a command channel; every lifecycle
//! command carries a oneshot reply, generation results flow back as events
//! on the [`EventBus`].

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ContinueGeneration, EngineHandle, FinishReason, InferenceBackend, Session, SessionOptions};
use crate::config::EngineConfig;
use crate::error::{EngineError, RequestError, SessionError};
use crate::events::{BridgeEvent, EventBus, RequestId};

const WORKER_THREAD_NAME: &str = "llmstream-engine";

enum WorkerCommand {
    OpenSession {
        reply_tx: oneshot::Sender<Result<bool, SessionError>>,
    },
    ResetSession {
        reply_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    CloseSession {
        reply_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    Generate {
        request_id: RequestId,
        prompt: String,
        cancel: CancellationToken,
    },
    Shutdown {
        reply_tx: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Submit-only access to the worker, handed to the request router.
#[derive(Clone)]
pub struct GenerationPort {
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl GenerationPort {
    /// Queue a generation. Results arrive on the event bus under `request_id`.
    pub fn submit(
        &self,
        request_id: RequestId,
        prompt: String,
        cancel: CancellationToken,
    ) -> Result<(), RequestError> {
        self.cmd_tx
            .send(WorkerCommand::Generate {
                request_id,
                prompt,
                cancel,
            })
            .map_err(|_| RequestError::WorkerShutdown)
    }

    /// Resolves once the worker thread has stopped accepting commands.
    pub async fn closed(&self) {
        self.cmd_tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Owner-side handle to the worker thread. Only the session manager holds one.
pub struct EngineWorker {
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl EngineWorker {
    /// Start the worker thread, load the engine and build the first session.
    pub async fn spawn(
        backend: Arc<dyn InferenceBackend>,
        asset: PathBuf,
        config: EngineConfig,
        top_p: f32,
        bus: EventBus,
    ) -> Result<Self, EngineError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                match WorkerState::start(backend.as_ref(), asset, config, top_p, bus) {
                    Ok(state) => {
                        let _ = ready_tx.send(Ok(()));
                        state.run(cmd_rx);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| EngineError::InitFailure(format!("failed to spawn engine worker: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::WorkerShutdown),
        }
    }

    pub fn port(&self) -> GenerationPort {
        GenerationPort {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Build a session if none is open. Returns whether one was built.
    pub async fn open_session(&self) -> Result<bool, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::OpenSession { reply_tx })
            .map_err(|_| SessionError::WorkerShutdown)?;
        reply_rx.await.map_err(|_| SessionError::WorkerShutdown)?
    }

    pub async fn reset_session(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::ResetSession { reply_tx })
            .map_err(|_| SessionError::WorkerShutdown)?;
        reply_rx.await.map_err(|_| SessionError::WorkerShutdown)?
    }

    pub async fn close_session(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::CloseSession { reply_tx })
            .map_err(|_| SessionError::WorkerShutdown)?;
        reply_rx.await.map_err(|_| SessionError::WorkerShutdown)?
    }

    /// Close the session, release the engine and join the thread.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let result = match self.cmd_tx.send(WorkerCommand::Shutdown { reply_tx }) {
            Ok(()) => reply_rx.await.unwrap_or(Err(EngineError::WorkerShutdown)),
            Err(_) => Err(EngineError::WorkerShutdown),
        };

        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!("Engine worker thread joined"),
                Ok(Err(_)) => error!("Engine worker thread panicked"),
                Err(e) => warn!("Failed to join engine worker thread: {}", e),
            }
        }
        result
    }
}

struct WorkerState {
    session: Option<Session>,
    engine: Option<EngineHandle>,
    options: SessionOptions,
    bus: EventBus,
}

impl WorkerState {
    fn start(
        backend: &dyn InferenceBackend,
        asset: PathBuf,
        config: EngineConfig,
        top_p: f32,
        bus: EventBus,
    ) -> Result<Self, EngineError> {
        let options = SessionOptions::from_config(&config, top_p);
        let mut engine = EngineHandle::open(backend, &asset, config)?;
        let session = Session::build(&mut engine, options.clone()).map_err(|e| {
            if let Err(close_err) = engine.close() {
                warn!("Engine close after failed session build also failed: {}", close_err);
            }
            EngineError::InitFailure(e.to_string())
        })?;

        let message = format!("Initialized LLM session with model: {}", asset.display());
        info!("{}", message);
        bus.publish(BridgeEvent::Logging { message });

        Ok(Self {
            session: Some(session),
            engine: Some(engine),
            options,
            bus,
        })
    }

    fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>) {
        while let Some(cmd) = cmd_rx.blocking_recv() {
            match cmd {
                WorkerCommand::Generate {
                    request_id,
                    prompt,
                    cancel,
                } => self.generate(request_id, &prompt, &cancel),
                WorkerCommand::OpenSession { reply_tx } => {
                    let _ = reply_tx.send(self.open_session());
                }
                WorkerCommand::ResetSession { reply_tx } => {
                    let _ = reply_tx.send(self.reset_session());
                }
                WorkerCommand::CloseSession { reply_tx } => {
                    let _ = reply_tx.send(self.close_session());
                }
                WorkerCommand::Shutdown { reply_tx } => {
                    let _ = reply_tx.send(self.shutdown());
                    return;
                }
            }
        }
        debug!("Engine command channel closed, releasing resources");
        if let Err(e) = self.shutdown() {
            warn!("Engine release after channel close failed: {}", e);
        }
    }

    fn generate(&mut self, request_id: RequestId, prompt: &str, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            debug!("Request {} cancelled before generation started", request_id);
            return;
        }

        let Some(session) = self.session.as_mut() else {
            self.bus.publish(BridgeEvent::Error {
                request_id,
                error: "session is not open".to_string(),
            });
            return;
        };

        debug!("Generating request {} ({} prompt bytes)", request_id, prompt.len());
        let bus = &self.bus;
        let mut response = String::new();
        let result = session.generate(prompt, &mut |delta| {
            if cancel.is_cancelled() {
                return ContinueGeneration::Stop;
            }
            response.push_str(delta);
            bus.publish(BridgeEvent::Partial {
                request_id,
                partial: delta.to_string(),
            });
            ContinueGeneration::Continue
        });

        match result {
            Ok(_) if cancel.is_cancelled() => {
                bus.publish(BridgeEvent::Logging {
                    message: format!("Request {} stopped", request_id),
                });
            }
            Ok(FinishReason::Stopped) => {
                debug!("Request {} stopped by backend", request_id);
                bus.publish(BridgeEvent::Complete { request_id, response });
            }
            Ok(reason) => {
                debug!("Request {} completed: {:?}", request_id, reason);
                bus.publish(BridgeEvent::Complete { request_id, response });
            }
            Err(e) => {
                warn!("Request {} failed: {}", request_id, e);
                bus.publish(BridgeEvent::Error {
                    request_id,
                    error: e.to_string(),
                });
            }
        }
    }

    fn open_session(&mut self) -> Result<bool, SessionError> {
        if self.session.is_some() {
            return Ok(false);
        }
        self.build_session()?;
        Ok(true)
    }

    fn reset_session(&mut self) -> Result<(), SessionError> {
        self.close_session()?;
        self.build_session()?;
        self.log("Session reset");
        Ok(())
    }

    fn close_session(&mut self) -> Result<(), SessionError> {
        match self.session.take() {
            Some(mut session) => {
                session.close()?;
                self.log("Session closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn build_session(&mut self) -> Result<(), SessionError> {
        let engine = self.engine.as_mut().ok_or(SessionError::NotReady)?;
        self.session = Some(Session::build(engine, self.options.clone())?);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        let session_result = self.close_session();
        let engine_result = match self.engine.take() {
            Some(mut engine) => engine.close(),
            None => Ok(()),
        };
        self.log("Engine closed");

        session_result?;
        engine_result
    }

    fn log(&self, message: &str) {
        info!("{}", message);
        self.bus.publish(BridgeEvent::Logging {
            message: message.to_string(),
        });
    }
}
