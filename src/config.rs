//! Configuration management for the llmstream bridge.
//!
//! Configuration is layered from multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/llmstream/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `LLMSTREAM_`, `__` between section and key)
//! 5. Command-line arguments
//!
//! Later sources override earlier ones.
//!
//! # Environment Variables
//!
//! - `LLMSTREAM_MODEL__PATH` - Location of the model asset
//! - `LLMSTREAM_ENGINE__ACCELERATOR` - `CPU` or `GPU`
//! - `LLMSTREAM_ROUTER__REQUEST_TIMEOUT_SECS` - Per-request timeout

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Top-p applied to every session; the engine contract fixes it.
pub const DEFAULT_TOP_P: f32 = 0.9;

/// Compute backend selected for the engine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Accelerator {
    #[default]
    #[serde(rename = "CPU", alias = "cpu")]
    Cpu,
    #[serde(rename = "GPU", alias = "gpu")]
    Gpu,
}

impl FromStr for Accelerator {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CPU" => Ok(Accelerator::Cpu),
            "GPU" => Ok(Accelerator::Gpu),
            other => Err(ConfigError::Invalid(format!(
                "unknown accelerator '{}', expected CPU or GPU",
                other
            ))),
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accelerator::Cpu => write!(f, "CPU"),
            Accelerator::Gpu => write!(f, "GPU"),
        }
    }
}

/// Engine construction parameters. Immutable once an engine handle is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_tokens: u32,
    pub top_k: u32,
    pub temperature: f32,
    #[serde(default)]
    pub random_seed: i64,
    #[serde(default)]
    pub accelerator: Accelerator,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            top_k: 40,
            temperature: 0.8,
            random_seed: 0,
            accelerator: Accelerator::Cpu,
        }
    }
}

impl EngineConfig {
    /// Reject parameter combinations no engine can be built from.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be greater than 0".into()));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Invalid("top_k must be greater than 0".into()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "temperature must be a finite value >= 0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Model asset location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub path: PathBuf,
}

/// Sampling settings applied when a session is (re)built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { top_p: default_top_p() }
    }
}

/// Request router settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Per-request timeout; `None` lets requests run until a terminal event.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl RouterSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Logging settings consumed by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub model: ModelSettings,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Command-line overrides shared by every subcommand.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Model asset path
    #[arg(long, global = true, env = "LLMSTREAM_MODEL_PATH")]
    pub model: Option<PathBuf>,

    /// Compute backend (CPU or GPU)
    #[arg(long, global = true)]
    pub accelerator: Option<String>,

    /// Maximum tokens per generation
    #[arg(long, global = true)]
    pub max_tokens: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

impl Settings {
    /// Settings for a model at `path` with every other value at its default.
    pub fn for_model(path: impl Into<PathBuf>) -> Self {
        Self {
            model: ModelSettings { path: path.into() },
            engine: EngineConfig::default(),
            session: SessionSettings::default(),
            router: RouterSettings::default(),
            logging: LoggingSettings::default(),
        }
    }

    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/llmstream/config.toml").required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("LLMSTREAM")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if let Some(model) = &args.model {
            settings.model.path = model.clone();
        }
        if let Some(accelerator) = &args.accelerator {
            settings.engine.accelerator = accelerator.parse()?;
        }
        if let Some(max_tokens) = args.max_tokens {
            settings.engine.max_tokens = max_tokens;
        }
        if let Some(timeout) = args.timeout_secs {
            settings.router.request_timeout_secs = Some(timeout);
        }
        if let Some(level) = &args.log_level {
            settings.logging.level = level.clone();
        }

        settings.engine.validate()?;
        Ok(settings)
    }
}

fn default_top_p() -> f32 {
    DEFAULT_TOP_P
}

fn default_log_level() -> String {
    "info".to_string()
}
