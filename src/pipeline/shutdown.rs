//! Cooperative shutdown.
//!
//! The first Ctrl+C asks the driver to stop at the next item boundary. The
//! second one kills any registered inference server group and exits the
//! process immediately with status 130.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::server::ServerKillSwitch;

/// Exit status used when a second interrupt aborts the process.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Shared stop flag checked between items.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    kill_switches: Arc<Mutex<Vec<ServerKillSwitch>>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            kill_switches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a server to kill when the process is forced to exit.
    pub fn kill_on_force_exit(&self, switch: ServerKillSwitch) {
        let mut switches = self.kill_switches.lock().unwrap_or_else(|e| e.into_inner());
        switches.push(switch);
    }

    /// Kills every registered server that is still running. Returns how many
    /// were killed.
    pub fn force_cleanup(&self) -> usize {
        let switches = self.kill_switches.lock().unwrap_or_else(|e| e.into_inner());
        switches.iter().filter_map(ServerKillSwitch::kill_active).count()
    }

    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Spawns the Ctrl+C listener.
    pub fn install_ctrl_c_handler(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("Could not listen for Ctrl+C");
                return;
            }
            tracing::warn!("Interrupt received, stopping after the current item (Ctrl+C again to exit now)");
            signal.request();

            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::error!("Second interrupt received, exiting immediately");
                signal.force_cleanup();
                std::process::exit(FORCED_EXIT_CODE);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelFiles;
    use crate::server::{ServerConfig, ServerManager};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_request_is_visible_to_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_requested());

        signal.request();
        assert!(clone.is_requested());
        tokio::time::timeout(Duration::from_secs(1), clone.requested())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_requested_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.requested().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.request();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_force_cleanup_kills_registered_servers() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("fake-server");
        std::fs::write(&binary, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let config = ServerConfig::new(binary)
            .with_address("127.0.0.1", 18099)
            .with_shutdown(Duration::from_secs(5), Duration::ZERO);
        let manager = ServerManager::new(config).unwrap();

        let signal = ShutdownSignal::new();
        signal.kill_on_force_exit(manager.kill_switch());
        assert_eq!(signal.clone().force_cleanup(), 0);

        let files = ModelFiles {
            language: "/models/lang.gguf".into(),
            vision: None,
        };
        let handle = manager.start(&files).unwrap();
        assert_eq!(signal.force_cleanup(), 1);

        manager.stop(handle).await.unwrap();
        assert_eq!(signal.force_cleanup(), 0);
    }
}
