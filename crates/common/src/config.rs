//! Configuration structures for ChatRelay
//!
//! Configuration is loaded from a YAML file or built from defaults, and can
//! be overridden by environment variables. It is immutable once the worker
//! has started.

use crate::error::{ChatRelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the YAML config file
pub const CONFIG_PATH_ENV: &str = "CHATRELAY_CONFIG";

/// Top-level configuration for the relay worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Control connection and identity
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Inference server
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Orchestration backend base address (ws:// or wss://)
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Model name advertised at handshake
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Timeout for establishing the control connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Close failed assignments with an explicit error packet
    #[serde(default)]
    pub send_error_packets: bool,
}

/// Inference server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Inference server base address (http:// or https://)
    #[serde(default = "default_inference_url")]
    pub url: String,

    /// Timeout for establishing the HTTP connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

/// Default value functions
fn default_backend_url() -> String {
    "ws://localhost:8000".to_string()
}

fn default_model_name() -> String {
    "distilgpt2".to_string()
}

fn default_inference_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            model_name: default_model_name(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            send_error_packets: false,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: default_inference_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            inference: InferenceConfig::default(),
            observability: None,
        }
    }
}

impl WorkerConfig {
    /// Control connection endpoint
    pub fn work_endpoint(&self) -> String {
        format!("{}/work", self.backend_url.trim_end_matches('/'))
    }

    /// Get reconnect delay as Duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl InferenceConfig {
    /// Streaming generation endpoint
    pub fn generate_stream_endpoint(&self) -> String {
        format!("{}/generate_stream", self.url.trim_end_matches('/'))
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl RelayConfig {
    /// Load configuration from `CHATRELAY_CONFIG` if set, defaults otherwise,
    /// then apply environment overrides
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Self::from_env(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ChatRelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config: RelayConfig = serde_yaml::from_str(&content).map_err(|e| {
            ChatRelayError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults and environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = RelayConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CHATRELAY_*` overrides resolved through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CHATRELAY_BACKEND_URL") {
            self.worker.backend_url = url;
        }
        if let Some(model_name) = lookup("CHATRELAY_MODEL_NAME") {
            self.worker.model_name = model_name;
        }
        if let Some(url) = lookup("CHATRELAY_INFERENCE_URL") {
            self.inference.url = url;
        }
        if let Some(delay) = lookup("CHATRELAY_RECONNECT_DELAY_MS") {
            self.worker.reconnect_delay_ms = delay
                .parse()
                .map_err(|_| ChatRelayError::config(format!("Invalid reconnect delay: {}", delay)))?;
        }
        if let Some(level) = lookup("CHATRELAY_LOG_LEVEL") {
            self.observability
                .get_or_insert_with(ObservabilityConfig::default)
                .log_level = level;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let backend = &self.worker.backend_url;
        if !(backend.starts_with("ws://") || backend.starts_with("wss://")) {
            return Err(ChatRelayError::config(format!(
                "Backend url must use ws:// or wss://: {}",
                backend
            )));
        }

        let inference = &self.inference.url;
        if !(inference.starts_with("http://") || inference.starts_with("https://")) {
            return Err(ChatRelayError::config(format!(
                "Inference url must use http:// or https://: {}",
                inference
            )));
        }

        if self.worker.model_name.trim().is_empty() {
            return Err(ChatRelayError::config("Model name must not be empty"));
        }

        if self.worker.reconnect_delay_ms == 0 {
            return Err(ChatRelayError::config("Reconnect delay must be positive"));
        }

        Ok(())
    }

    /// Configured log level
    pub fn log_level(&self) -> &str {
        self.observability
            .as_ref()
            .map(|o| o.log_level.as_str())
            .unwrap_or("info")
    }

    /// Whether to emit JSON log lines
    pub fn structured_logging(&self) -> bool {
        self.observability
            .as_ref()
            .map(|o| o.structured_logging)
            .unwrap_or(false)
    }
}
