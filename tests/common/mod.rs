//! Common test utilities for the streaming bridge

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use llmstream_core::{
    config::Settings,
    engine::ScriptedBackend,
    events::{BridgeEvent, EventListener},
    manager::SessionManager,
    rpc::NativeBridge,
    EngineConfig,
};
use tempfile::NamedTempFile;

pub struct TestBridge {
    pub manager: Arc<SessionManager>,
    pub backend: ScriptedBackend,
    /// Keeps the model asset alive for the test's duration
    pub asset: NamedTempFile,
}

impl TestBridge {
    pub fn bridge(&self) -> NativeBridge {
        NativeBridge::new(Arc::clone(&self.manager))
    }
}

/// Create a model asset file the engine handle accepts.
pub fn model_asset() -> NamedTempFile {
    let asset = tempfile::Builder::new()
        .prefix("gemma3-1b-it-int4")
        .suffix(".task")
        .tempfile()
        .expect("create model asset");
    std::fs::write(asset.path(), b"scripted weights").expect("write model asset");
    asset
}

/// Manager over `backend` without a loaded model.
pub fn uninitialized(backend: ScriptedBackend) -> TestBridge {
    with_settings(backend, |_| {})
}

pub fn with_settings(backend: ScriptedBackend, customize: impl FnOnce(&mut Settings)) -> TestBridge {
    let asset = model_asset();
    let mut settings = Settings::for_model(asset.path());
    customize(&mut settings);
    let manager = Arc::new(SessionManager::new(Arc::new(backend.clone()), settings));
    TestBridge {
        manager,
        backend,
        asset,
    }
}

/// Manager over `backend` with the model created from default engine settings.
pub async fn ready(backend: ScriptedBackend) -> TestBridge {
    let bridge = uninitialized(backend);
    bridge
        .manager
        .create_model(EngineConfig::default())
        .await
        .expect("create model");
    bridge
}

/// The scripted backend from the canonical "Hello" exchange.
pub fn hello_backend() -> ScriptedBackend {
    ScriptedBackend::new().with_reply("Hello", ["He", "llo ", "there"])
}

/// Collect listener events until `count` matching events arrive or a second passes.
pub async fn collect_events(listener: &mut EventListener, count: usize) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    while events.len() < count {
        match tokio::time::timeout(Duration::from_secs(1), listener.recv()).await {
            Ok(Some(event)) => events.push(event),
            _ => break,
        }
    }
    events
}

/// Wait until the router holds no requests.
pub async fn wait_idle(manager: &SessionManager) {
    for _ in 0..200 {
        if manager.router().pending() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("router still has {} requests", manager.router().pending());
}

/// Assert that no event reaches `listener` within a short grace period.
pub async fn assert_quiet(listener: &mut EventListener) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), listener.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}
