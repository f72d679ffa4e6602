//! Deterministic in-process backend.
//!
//! Produces canned or echo-style replies token by token, remembers the
//! conversation so context resets are observable, and can be told to fail at
//! load, mid-stream or at close. The binary uses it when no native runtime is
//! linked in; tests use it to drive the bridge end to end.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    ContinueGeneration, FinishReason, InferenceBackend, InferenceSession, LoadedModel,
    SessionOptions,
};
use crate::config::{Accelerator, EngineConfig};
use crate::error::BackendError;

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicUsize,
    sessions: AtomicUsize,
    generations: AtomicUsize,
    engine_closes: AtomicUsize,
    close_order: Mutex<Vec<&'static str>>,
}

#[derive(Debug, Clone, Default)]
struct Script {
    replies: HashMap<String, Vec<String>>,
    failures: HashMap<String, (usize, String)>,
    token_delay: Option<Duration>,
    load_failure: Option<String>,
    session_close_failure: Option<String>,
    engine_close_failure: Option<String>,
    gpu_unavailable: bool,
}

/// Scripted inference backend. Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    script: Script,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to `prompt` with exactly these tokens.
    pub fn with_reply<I, S>(mut self, prompt: &str, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .replies
            .insert(prompt.to_string(), tokens.into_iter().map(Into::into).collect());
        self
    }

    /// Emit `after_tokens` tokens for `prompt`, then fail with `message`.
    pub fn fail_after(mut self, prompt: &str, after_tokens: usize, message: &str) -> Self {
        self.script
            .failures
            .insert(prompt.to_string(), (after_tokens, message.to_string()));
        self
    }

    /// Sleep between tokens, simulating a slow device.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.script.token_delay = Some(delay);
        self
    }

    pub fn fail_load(mut self, message: &str) -> Self {
        self.script.load_failure = Some(message.to_string());
        self
    }

    pub fn fail_session_close(mut self, message: &str) -> Self {
        self.script.session_close_failure = Some(message.to_string());
        self
    }

    pub fn fail_engine_close(mut self, message: &str) -> Self {
        self.script.engine_close_failure = Some(message.to_string());
        self
    }

    /// Refuse to load on the GPU accelerator.
    pub fn without_gpu(mut self) -> Self {
        self.script.gpu_unavailable = true;
        self
    }

    /// Number of engines constructed so far.
    pub fn load_count(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    /// Number of sessions constructed so far.
    pub fn session_count(&self) -> usize {
        self.counters.sessions.load(Ordering::SeqCst)
    }

    /// Number of generations started so far.
    pub fn generation_count(&self) -> usize {
        self.counters.generations.load(Ordering::SeqCst)
    }

    pub fn engine_close_count(&self) -> usize {
        self.counters.engine_closes.load(Ordering::SeqCst)
    }

    /// Backend objects in the order they were closed: `"session"` or `"engine"`.
    pub fn close_order(&self) -> Vec<&'static str> {
        self.counters.close_order.lock().clone()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load(
        &self,
        _asset: &Path,
        config: &EngineConfig,
    ) -> Result<Box<dyn LoadedModel>, BackendError> {
        if let Some(message) = &self.script.load_failure {
            return Err(BackendError::msg(message.clone()));
        }
        if self.script.gpu_unavailable && config.accelerator == Accelerator::Gpu {
            return Err(BackendError::UnsupportedAccelerator(config.accelerator.to_string()));
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedModel {
            script: self.script.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedModel {
    script: Script,
    counters: Arc<Counters>,
}

impl LoadedModel for ScriptedModel {
    fn create_session(
        &mut self,
        options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, BackendError> {
        self.counters.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            counters: Arc::clone(&self.counters),
            max_tokens: options.max_tokens as usize,
            pending_query: String::new(),
            history: Vec::new(),
        }))
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.counters.close_order.lock().push("engine");
        self.counters.engine_closes.fetch_add(1, Ordering::SeqCst);
        match &self.script.engine_close_failure {
            Some(message) => Err(BackendError::msg(message.clone())),
            None => Ok(()),
        }
    }
}

struct ScriptedSession {
    script: Script,
    counters: Arc<Counters>,
    max_tokens: usize,
    pending_query: String,
    history: Vec<String>,
}

impl ScriptedSession {
    fn reply_for(&self, prompt: &str) -> Vec<String> {
        if let Some(tokens) = self.script.replies.get(prompt) {
            return tokens.clone();
        }

        let text = match self.history.last() {
            Some(previous) => format!(
                "Echo: {} (after {} turns, last: {})",
                prompt,
                self.history.len(),
                previous
            ),
            None => format!("Echo: {}", prompt),
        };
        split_words(&text)
    }
}

impl InferenceSession for ScriptedSession {
    fn add_query_chunk(&mut self, text: &str) -> Result<(), BackendError> {
        self.pending_query.push_str(text);
        Ok(())
    }

    fn generate(
        &mut self,
        on_token: &mut dyn FnMut(&str) -> ContinueGeneration,
    ) -> Result<FinishReason, BackendError> {
        self.counters.generations.fetch_add(1, Ordering::SeqCst);
        let prompt = std::mem::take(&mut self.pending_query);
        let tokens = self.reply_for(&prompt);
        let failure = self.script.failures.get(&prompt).cloned();

        for (emitted, token) in tokens.iter().enumerate() {
            if let Some((after, message)) = &failure {
                if emitted == *after {
                    return Err(BackendError::msg(message.clone()));
                }
            }
            if emitted == self.max_tokens {
                self.history.push(prompt);
                return Ok(FinishReason::MaxTokens);
            }
            if let Some(delay) = self.script.token_delay {
                std::thread::sleep(delay);
            }
            if on_token(token) == ContinueGeneration::Stop {
                debug!("Scripted generation stopped after {} tokens", emitted + 1);
                return Ok(FinishReason::Stopped);
            }
        }

        if let Some((_, message)) = failure {
            return Err(BackendError::msg(message));
        }

        self.history.push(prompt);
        Ok(FinishReason::EndOfSequence)
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.counters.close_order.lock().push("session");
        match &self.script.session_close_failure {
            Some(message) => Err(BackendError::msg(message.clone())),
            None => Ok(()),
        }
    }
}

/// Split text into word tokens, keeping each separating space on the left word.
fn split_words(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if c == ' ' {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(session: &mut dyn InferenceSession, prompt: &str) -> Result<String, BackendError> {
        session.add_query_chunk(prompt)?;
        let mut text = String::new();
        session.generate(&mut |t| {
            text.push_str(t);
            ContinueGeneration::Continue
        })?;
        Ok(text)
    }

    fn new_session(backend: &ScriptedBackend) -> Box<dyn InferenceSession> {
        let config = EngineConfig::default();
        let mut model = backend.load(Path::new("unused"), &config).unwrap();
        model.create_session(&SessionOptions::from(&config)).unwrap()
    }

    #[test]
    fn test_split_words() {
        assert_eq!(split_words("a bc d"), vec!["a ", "bc ", "d"]);
        assert_eq!(split_words("trailing "), vec!["trailing "]);
        assert!(split_words("").is_empty());
    }

    #[test]
    fn test_echo_reply_tracks_history() {
        let backend = ScriptedBackend::new();
        let mut session = new_session(&backend);

        assert_eq!(collect(session.as_mut(), "hi").unwrap(), "Echo: hi");
        assert_eq!(
            collect(session.as_mut(), "again").unwrap(),
            "Echo: again (after 1 turns, last: hi)"
        );
        assert_eq!(backend.generation_count(), 2);
    }

    #[test]
    fn test_mid_stream_failure() {
        let backend = ScriptedBackend::new()
            .with_reply("boom", ["a", "b", "c"])
            .fail_after("boom", 2, "kernel fault");
        let mut session = new_session(&backend);

        session.add_query_chunk("boom").unwrap();
        let mut seen = Vec::new();
        let result = session.generate(&mut |t| {
            seen.push(t.to_string());
            ContinueGeneration::Continue
        });
        assert_eq!(result, Err(BackendError::msg("kernel fault")));
        assert_eq!(seen, vec!["a", "b"]);

        // Failed turns are not remembered
        assert_eq!(collect(session.as_mut(), "next").unwrap(), "Echo: next");
    }

    #[test]
    fn test_max_tokens_truncates() {
        let backend = ScriptedBackend::new().with_reply("long", ["1", "2", "3", "4"]);
        let config = EngineConfig { max_tokens: 2, ..Default::default() };
        let mut model = backend.load(Path::new("unused"), &config).unwrap();
        let mut session = model.create_session(&SessionOptions::from(&config)).unwrap();

        session.add_query_chunk("long").unwrap();
        let mut text = String::new();
        let reason = session
            .generate(&mut |t| {
                text.push_str(t);
                ContinueGeneration::Continue
            })
            .unwrap();
        assert_eq!(reason, FinishReason::MaxTokens);
        assert_eq!(text, "12");
    }

    #[test]
    fn test_gpu_unavailable() {
        let backend = ScriptedBackend::new().without_gpu();
        let config = EngineConfig { accelerator: Accelerator::Gpu, ..Default::default() };
        assert!(matches!(
            backend.load(Path::new("unused"), &config),
            Err(BackendError::UnsupportedAccelerator(_))
        ));
        assert_eq!(backend.load_count(), 0);
    }
}
