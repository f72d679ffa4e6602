//! Session manager facade.
//!
//! Public create / generate / reset / close contract consumed by the UI layer.
//! The manager exclusively owns the engine worker; the router only ever sees a
//! submit-only port to it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, Settings};
use crate::engine::{EngineWorker, InferenceBackend};
use crate::error::{EngineError, RequestError, SessionError};
use crate::events::{EventBus, RequestId};
use crate::router::{
    CallbackSink, GenerateOptions, GenerateResponse, GenerationHandle, RequestRouter,
    ResponseSink, RouterStats,
};

/// Process-wide engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
    Closing,
    Closed,
}

/// Acknowledgement returned by lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Created,
    AlreadyCreated,
    SessionReset,
    SessionClosed,
    EngineClosed,
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Ack::Created => "Model Creation Successful",
            Ack::AlreadyCreated => "Model already created",
            Ack::SessionReset => "Session reset",
            Ack::SessionClosed => "Session closed",
            Ack::EngineClosed => "Engine closed",
        };
        f.write_str(text)
    }
}

/// Owner of the engine handle, its session and the request router.
pub struct SessionManager {
    backend: Arc<dyn InferenceBackend>,
    settings: Settings,
    bus: EventBus,
    router: RequestRouter,
    worker: Mutex<Option<EngineWorker>>,
    state_tx: watch::Sender<LifecycleState>,
    session_open: AtomicBool,
}

impl SessionManager {
    /// Create a manager with a fresh event bus. Requires a tokio runtime.
    pub fn new(backend: Arc<dyn InferenceBackend>, settings: Settings) -> Self {
        Self::with_bus(backend, settings, EventBus::new())
    }

    pub fn with_bus(backend: Arc<dyn InferenceBackend>, settings: Settings, bus: EventBus) -> Self {
        let router = RequestRouter::new(bus.clone(), settings.router.request_timeout());
        let (state_tx, _) = watch::channel(LifecycleState::Uninitialized);
        info!(
            "Session manager using backend {} for {}",
            backend.name(),
            settings.model.path.display()
        );

        Self {
            backend,
            settings,
            bus,
            router,
            worker: Mutex::new(None),
            state_tx,
            session_open: AtomicBool::new(false),
        }
    }

    /// Load the engine and build a session, unless an engine already exists.
    pub async fn create_model(&self, config: EngineConfig) -> Result<Ack, EngineError> {
        let mut worker = self.worker.lock().await;

        if let Some(existing) = worker.as_ref() {
            if !self.session_open.load(Ordering::SeqCst) {
                debug!("Engine present without session, rebuilding session");
                existing.open_session().await?;
                self.session_open.store(true, Ordering::SeqCst);
            }
            self.set_state(LifecycleState::Ready);
            info!("Model already created");
            return Ok(Ack::AlreadyCreated);
        }

        self.set_state(LifecycleState::Loading);
        let spawned = EngineWorker::spawn(
            Arc::clone(&self.backend),
            self.settings.model.path.clone(),
            config,
            self.settings.session.top_p,
            self.bus.clone(),
        )
        .await;

        match spawned {
            Ok(engine) => {
                self.router.attach(engine.port());
                *worker = Some(engine);
                self.session_open.store(true, Ordering::SeqCst);
                self.set_state(LifecycleState::Ready);
                info!("Model Creation Successful");
                Ok(Ack::Created)
            }
            Err(e) => {
                error!("Model creation failed: {}", e);
                self.set_state(LifecycleState::Uninitialized);
                Err(e)
            }
        }
    }

    /// [`create_model`](Self::create_model) with the configured engine settings.
    pub async fn create_default_model(&self) -> Result<Ack, EngineError> {
        self.create_model(self.settings.engine.clone()).await
    }

    /// Replace the session with a fresh one, keeping the loaded engine.
    pub async fn reset_session(&self) -> Result<Ack, EngineError> {
        let worker = self.worker.lock().await;
        let engine = worker.as_ref().ok_or(EngineError::NotReady)?;

        self.session_open.store(false, Ordering::SeqCst);
        self.router.abort_all(RequestError::Closed).await;

        engine.reset_session().await?;
        self.session_open.store(true, Ordering::SeqCst);
        Ok(Ack::SessionReset)
    }

    /// Release the session. Succeeds trivially when none is open.
    pub async fn close_session(&self) -> Result<Ack, SessionError> {
        let worker = self.worker.lock().await;
        let Some(engine) = worker.as_ref() else {
            return Ok(Ack::SessionClosed);
        };
        if !self.session_open.swap(false, Ordering::SeqCst) {
            return Ok(Ack::SessionClosed);
        }

        self.router.abort_all(RequestError::Closed).await;
        engine.close_session().await?;
        Ok(Ack::SessionClosed)
    }

    /// Close the session, then release the engine.
    pub async fn close_engine(&self) -> Result<Ack, EngineError> {
        let mut worker = self.worker.lock().await;
        let Some(engine) = worker.take() else {
            debug!("close_engine with no engine loaded");
            return Ok(Ack::EngineClosed);
        };

        self.set_state(LifecycleState::Closing);
        self.session_open.store(false, Ordering::SeqCst);
        self.router.detach();
        self.router.abort_all(RequestError::Closed).await;

        let result = engine.shutdown().await;
        self.set_state(LifecycleState::Closed);
        if let Err(e) = &result {
            warn!("Engine released with errors: {}", e);
        }
        result.map(|_| Ack::EngineClosed)
    }

    /// Submit a prompt. Fails immediately with `NotReady` unless a model and
    /// session are loaded.
    pub fn generate_response(&self, prompt: impl Into<String>) -> Result<GenerationHandle, RequestError> {
        self.generate_with_options(prompt, GenerateOptions::default())
    }

    pub fn generate_with_options(
        &self,
        prompt: impl Into<String>,
        options: GenerateOptions,
    ) -> Result<GenerationHandle, RequestError> {
        if !self.is_ready() || !self.has_session() {
            return Err(RequestError::NotReady);
        }
        self.router.submit(prompt, options)
    }

    /// Submit a prompt and wait for the full response.
    pub async fn generate(&self, prompt: impl Into<String>) -> Result<GenerateResponse, RequestError> {
        self.generate_response(prompt)?.finish().await
    }

    /// Submit a prompt, streaming partials and errors into `sink`.
    pub async fn generate_with_sink<S>(
        &self,
        prompt: impl Into<String>,
        sink: &mut S,
    ) -> Result<GenerateResponse, RequestError>
    where
        S: ResponseSink + ?Sized,
    {
        self.generate_response(prompt)?.drive(sink).await
    }

    /// Callback form: resolves to the concatenated response text.
    pub async fn generate_with_callbacks<P, E>(
        &self,
        prompt: impl Into<String>,
        on_partial: P,
        on_error: E,
    ) -> Result<String, RequestError>
    where
        P: FnMut(&str, RequestId) + Send,
        E: FnMut(&str, RequestId) + Send,
    {
        let mut sink = CallbackSink::new(on_partial, on_error);
        let response = self.generate_with_sink(prompt, &mut sink).await?;
        Ok(response.response)
    }

    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.router.cancel(request_id)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    pub fn has_session(&self) -> bool {
        self.session_open.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn stats(&self) -> RouterStats {
        self.router.stats()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Lifecycle {:?} -> {:?}", previous, state);
        }
    }
}
