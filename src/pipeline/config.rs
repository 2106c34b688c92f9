//! Worker configuration.
//!
//! Values are layered, later layers winning: built-in defaults, an optional
//! YAML file, `VLM_WORKER_*` environment variables, then command line flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::server::ServerConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for a worker run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    // Storage
    /// SQLite file holding the work items.
    pub database_path: PathBuf,
    /// Directory the asset keys are relative to.
    pub asset_root: PathBuf,
    /// Directory laid out as `<repository>/<file>` for model weights.
    pub models_dir: PathBuf,
    /// Optional directory of prompt overrides.
    pub prompts_dir: Option<PathBuf>,

    // Inference server
    pub server_binary: PathBuf,
    pub server_host: String,
    pub server_port: u16,
    pub context_size: u32,
    pub gpu_layers: u32,
    pub ready_timeout_secs: u64,

    // Run behavior
    /// Minimum pending backlog before a caption run claims anything.
    pub min_backlog: u64,
    /// Page size for backfill selection.
    pub batch_size: usize,
    /// Pause between items, in milliseconds.
    pub item_pause_ms: u64,
    /// Generation attempts per call when output is repetitive.
    pub max_attempts: u32,
    pub repetition_min_length: usize,
    pub repetition_threshold: usize,

    // Models
    pub caption_models: Vec<String>,
    /// Caption model whose output feeds age estimation.
    pub caption_source_model: String,
    pub age_model: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("vlm-worker.db"),
            asset_root: PathBuf::from("images"),
            models_dir: PathBuf::from("models"),
            prompts_dir: None,

            server_binary: PathBuf::from("llama-server"),
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            context_size: 8192,
            gpu_layers: 99,
            ready_timeout_secs: 180,

            min_backlog: 100,
            batch_size: 1000,
            item_pause_ms: 500,
            max_attempts: 3,
            repetition_min_length: 10,
            repetition_threshold: 3,

            caption_models: vec!["minicpm".to_string()],
            caption_source_model: "minicpm".to_string(),
            age_model: "qwen3".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overlaid with `path` when given, then with the environment.
    /// The result is validated.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// environment variable is malformed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file. Keys absent from the file keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Applies `VLM_WORKER_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `VLM_WORKER_DATABASE_PATH`, `VLM_WORKER_ASSET_ROOT`,
    ///   `VLM_WORKER_MODELS_DIR`, `VLM_WORKER_PROMPTS_DIR`
    /// - `VLM_WORKER_SERVER_BINARY`, `VLM_WORKER_SERVER_HOST`,
    ///   `VLM_WORKER_SERVER_PORT`, `VLM_WORKER_CONTEXT_SIZE`,
    ///   `VLM_WORKER_GPU_LAYERS`, `VLM_WORKER_READY_TIMEOUT_SECS`
    /// - `VLM_WORKER_MIN_BACKLOG`, `VLM_WORKER_BATCH_SIZE`,
    ///   `VLM_WORKER_ITEM_PAUSE_MS`, `VLM_WORKER_MAX_ATTEMPTS`
    /// - `VLM_WORKER_CAPTION_MODELS` (comma-separated),
    ///   `VLM_WORKER_CAPTION_SOURCE_MODEL`, `VLM_WORKER_AGE_MODEL`
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Applies variables from `lookup` instead of the process environment.
    pub fn with_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(val) = lookup("VLM_WORKER_DATABASE_PATH") {
            self.database_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("VLM_WORKER_ASSET_ROOT") {
            self.asset_root = PathBuf::from(val);
        }
        if let Some(val) = lookup("VLM_WORKER_MODELS_DIR") {
            self.models_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("VLM_WORKER_PROMPTS_DIR") {
            self.prompts_dir = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("VLM_WORKER_SERVER_BINARY") {
            self.server_binary = PathBuf::from(val);
        }
        if let Some(val) = lookup("VLM_WORKER_SERVER_HOST") {
            self.server_host = val;
        }
        if let Some(val) = lookup("VLM_WORKER_SERVER_PORT") {
            self.server_port = parse_env_value(&val, "VLM_WORKER_SERVER_PORT")?;
        }
        if let Some(val) = lookup("VLM_WORKER_CONTEXT_SIZE") {
            self.context_size = parse_env_value(&val, "VLM_WORKER_CONTEXT_SIZE")?;
        }
        if let Some(val) = lookup("VLM_WORKER_GPU_LAYERS") {
            self.gpu_layers = parse_env_value(&val, "VLM_WORKER_GPU_LAYERS")?;
        }
        if let Some(val) = lookup("VLM_WORKER_READY_TIMEOUT_SECS") {
            self.ready_timeout_secs = parse_env_value(&val, "VLM_WORKER_READY_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("VLM_WORKER_MIN_BACKLOG") {
            self.min_backlog = parse_env_value(&val, "VLM_WORKER_MIN_BACKLOG")?;
        }
        if let Some(val) = lookup("VLM_WORKER_BATCH_SIZE") {
            self.batch_size = parse_env_value(&val, "VLM_WORKER_BATCH_SIZE")?;
        }
        if let Some(val) = lookup("VLM_WORKER_ITEM_PAUSE_MS") {
            self.item_pause_ms = parse_env_value(&val, "VLM_WORKER_ITEM_PAUSE_MS")?;
        }
        if let Some(val) = lookup("VLM_WORKER_MAX_ATTEMPTS") {
            self.max_attempts = parse_env_value(&val, "VLM_WORKER_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("VLM_WORKER_CAPTION_MODELS") {
            self.caption_models = split_list(&val);
        }
        if let Some(val) = lookup("VLM_WORKER_CAPTION_SOURCE_MODEL") {
            self.caption_source_model = val;
        }
        if let Some(val) = lookup("VLM_WORKER_AGE_MODEL") {
            self.age_model = val;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_binary.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "server_binary cannot be empty".to_string(),
            ));
        }

        if self.server_host.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "server_host cannot be empty".to_string(),
            ));
        }

        if self.ready_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "ready_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.min_backlog == 0 {
            return Err(ConfigError::ValidationFailed(
                "min_backlog must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.repetition_min_length == 0 || self.repetition_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "repetition_min_length and repetition_threshold must be greater than 0".to_string(),
            ));
        }

        if self.caption_models.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "caption_models cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn item_pause(&self) -> Duration {
        Duration::from_millis(self.item_pause_ms)
    }

    /// Server settings derived from this configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            binary: self.server_binary.clone(),
            host: self.server_host.clone(),
            port: self.server_port,
            context_size: self.context_size,
            gpu_layers: self.gpu_layers,
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            ..ServerConfig::default()
        }
    }
}

/// Splits a comma-separated list, dropping empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses an environment variable value.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_backlog, 100);
        assert_eq!(config.item_pause(), Duration::from_millis(500));
        assert_eq!(config.caption_models, vec!["minicpm"]);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = WorkerConfig::from_yaml_str(
            "database_path: /data/items.db\nserver_port: 9090\ncaption_models: [minicpm, joycaption]\n",
        )
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/data/items.db"));
        assert_eq!(config.server_port, 9090);
        assert_eq!(config.caption_models, vec!["minicpm", "joycaption"]);
        assert_eq!(config.age_model, "qwen3");
    }

    #[test]
    fn test_yaml_file_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker.yaml");
        std::fs::write(&path, "server_port: [not a port]\n").unwrap();

        assert!(matches!(
            WorkerConfig::from_yaml_file(&path),
            Err(ConfigError::Yaml { .. })
        ));
        assert!(matches!(
            WorkerConfig::from_yaml_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let config = WorkerConfig::default()
            .with_env_from(env(&[
                ("VLM_WORKER_SERVER_PORT", "8181"),
                ("VLM_WORKER_CAPTION_MODELS", "joycaption, minicpm,"),
                ("VLM_WORKER_PROMPTS_DIR", "/etc/prompts"),
            ]))
            .unwrap();
        assert_eq!(config.server_port, 8181);
        assert_eq!(config.caption_models, vec!["joycaption", "minicpm"]);
        assert_eq!(config.prompts_dir, Some(PathBuf::from("/etc/prompts")));
    }

    #[test]
    fn test_invalid_env_value() {
        let err = WorkerConfig::default()
            .with_env_from(env(&[("VLM_WORKER_BATCH_SIZE", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "VLM_WORKER_BATCH_SIZE"));
    }

    #[test]
    fn test_validation() {
        let mut config = WorkerConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.server_binary = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.caption_models.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config() {
        let mut config = WorkerConfig::default();
        config.server_port = 9000;
        config.ready_timeout_secs = 60;
        let server = config.server_config();
        assert_eq!(server.port, 9000);
        assert_eq!(server.ready_timeout, Duration::from_secs(60));
        assert_eq!(server.stop_timeout, Duration::from_secs(10));
    }
}
