//! Engine handle: owns the loaded model resource.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{InferenceBackend, InferenceSession, LoadedModel, SessionOptions};
use crate::config::EngineConfig;
use crate::error::{BackendError, EngineError, SessionError};

/// The expensive, loaded generative-model resource.
///
/// Built once per configuration and released only through [`EngineHandle::close`].
pub struct EngineHandle {
    model: Option<Box<dyn LoadedModel>>,
    config: EngineConfig,
    asset: PathBuf,
}

impl EngineHandle {
    /// Validate the model asset and load it through `backend`.
    pub fn open(
        backend: &dyn InferenceBackend,
        asset: &Path,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InitFailure(e.to_string()))?;

        if !asset.is_file() {
            warn!("Model asset missing at {}", asset.display());
            return Err(EngineError::AssetMissing { path: asset.to_path_buf() });
        }

        info!(
            "Loading model {} with backend {} on {}",
            asset.display(),
            backend.name(),
            config.accelerator
        );
        let model = backend
            .load(asset, &config)
            .map_err(|e| EngineError::InitFailure(e.to_string()))?;

        Ok(Self {
            model: Some(model),
            config,
            asset: asset.to_path_buf(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn asset(&self) -> &Path {
        &self.asset
    }

    pub fn is_open(&self) -> bool {
        self.model.is_some()
    }

    pub(crate) fn create_session(
        &mut self,
        options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, SessionError> {
        let model = self.model.as_mut().ok_or(SessionError::NotReady)?;
        debug!(
            "Creating session top_k={} top_p={} temperature={} seed={}",
            options.top_k, options.top_p, options.temperature, options.random_seed
        );
        model
            .create_session(options)
            .map_err(|e| SessionError::BuildFailed(e.to_string()))
    }

    /// Release the model. The reference is dropped even if the backend fails.
    pub fn close(&mut self) -> Result<(), EngineError> {
        match self.model.take() {
            Some(mut model) => model.close().map_err(|e: BackendError| {
                warn!("Engine close failed: {}", e);
                EngineError::CloseFailed(e.to_string())
            }),
            None => Ok(()),
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.model.is_some() {
            if let Err(e) = self.close() {
                warn!("Engine dropped without clean close: {}", e);
            }
        }
    }
}
