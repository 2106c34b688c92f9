//! Launch settings for `llama-server`.

use std::path::PathBuf;
use std::time::Duration;

use crate::registry::ModelFiles;

/// Settings for launching and supervising one inference server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Path to the `llama-server` executable.
    pub binary: PathBuf,
    pub host: String,
    pub port: u16,
    /// Context window in tokens (`-c`).
    pub context_size: u32,
    /// Layers offloaded to the GPU (`-ngl`).
    pub gpu_layers: u32,
    /// Delay before the first health probe.
    pub startup_grace: Duration,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
    /// How long to wait after SIGTERM before killing the process group.
    pub stop_timeout: Duration,
    /// Pause after a stop so the port is free for the next server.
    pub port_release_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("llama-server"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            context_size: 8192,
            gpu_layers: 99,
            startup_grace: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(180),
            stop_timeout: Duration::from_secs(10),
            port_release_delay: Duration::from_secs(3),
        }
    }
}

impl ServerConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Sets the startup grace, poll interval and readiness ceiling.
    pub fn with_readiness(
        mut self,
        startup_grace: Duration,
        poll_interval: Duration,
        ready_timeout: Duration,
    ) -> Self {
        self.startup_grace = startup_grace;
        self.poll_interval = poll_interval;
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn with_shutdown(mut self, stop_timeout: Duration, port_release_delay: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self.port_release_delay = port_release_delay;
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Command line arguments for serving `files`.
    pub fn build_args(&self, files: &ModelFiles) -> Vec<String> {
        let mut args = vec!["-m".to_string(), files.language.display().to_string()];
        if let Some(vision) = &files.vision {
            args.push("--mmproj".to_string());
            args.push(vision.display().to_string());
        }

        let port = self.port.to_string();
        let context_size = self.context_size.to_string();
        let gpu_layers = self.gpu_layers.to_string();
        let rest: &[&str] = &[
            "--host",
            &self.host,
            "--port",
            &port,
            "-c",
            &context_size,
            "-ngl",
            &gpu_layers,
            "--cont-batching",
            "--slots",
            "--metrics",
            "--threads-http",
            "4",
            "--timeout",
            "600",
            "--temp",
            "0.7",
            "--top-p",
            "0.8",
            "--top-k",
            "40",
            "--repeat-penalty",
            "1.05",
        ];
        args.extend(rest.iter().map(|arg| arg.to_string()));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(vision: bool) -> ModelFiles {
        ModelFiles {
            language: PathBuf::from("/models/lang.gguf"),
            vision: vision.then(|| PathBuf::from("/models/mmproj.gguf")),
        }
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.base_url(), "http://127.0.0.1:8080");
        assert_eq!(config.ready_timeout, Duration::from_secs(180));
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_args_with_projector() {
        let args = ServerConfig::default().build_args(&files(true));
        assert_eq!(
            &args[..4],
            ["-m", "/models/lang.gguf", "--mmproj", "/models/mmproj.gguf"]
        );
        let port = args.iter().position(|a| a == "--port").unwrap();
        assert_eq!(args[port + 1], "8080");
        let ctx = args.iter().position(|a| a == "-c").unwrap();
        assert_eq!(args[ctx + 1], "8192");
    }

    #[test]
    fn test_args_text_only() {
        let args = ServerConfig::default()
            .with_address("0.0.0.0", 9000)
            .build_args(&files(false));
        assert!(!args.iter().any(|a| a == "--mmproj"));
        assert_eq!(&args[..4], ["-m", "/models/lang.gguf", "--host", "0.0.0.0"]);
        assert!(args.contains(&"9000".to_string()));
    }
}
