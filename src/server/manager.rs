//! Process lifecycle for the inference server.
//!
//! The server runs in its own process group so that stopping it also takes
//! down any helper processes it forked. A [`ServerHandle`] owns the child;
//! dropping a handle that was never stopped kills the whole group.

use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use super::config::ServerConfig;
use crate::error::ServerError;
use crate::metrics::MetricsCollector;
use crate::registry::ModelFiles;

/// Marker stored while a spawn is in flight.
const SPAWNING: u32 = u32::MAX;

/// Timeout for a single `/health` probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health of a managed server. Only moves forward:
/// `Starting` to `Ready` or `Failed`, and anything to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl HealthState {
    fn rank(self) -> u8 {
        match self {
            HealthState::Starting => 0,
            HealthState::Ready | HealthState::Failed => 1,
            HealthState::Stopped => 2,
        }
    }

    pub fn can_advance_to(self, next: HealthState) -> bool {
        next.rank() > self.rank()
    }
}

/// Address of a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }
}

/// Exclusive ownership of one server process.
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
    pid: u32,
    endpoint: ServerEndpoint,
    state: HealthState,
    started_at: Instant,
    active: Arc<AtomicU32>,
}

impl ServerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Moves to `next` if that is a forward transition.
    fn advance(&mut self, next: HealthState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn pgid(&self) -> Pid {
        // The child leads its own group.
        Pid::from_raw(self.pid as i32)
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn release(&mut self) {
        if self.advance(HealthState::Stopped) {
            self.active.store(0, Ordering::SeqCst);
            MetricsCollector::new().set_server_running(false);
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.state == HealthState::Stopped {
            return;
        }
        tracing::warn!(pid = self.pid, "Server handle dropped while running, killing process group");
        let _ = killpg(self.pgid(), Signal::SIGKILL);
        let _ = self.child.start_kill();
        self.release();
    }
}

/// Kills a manager's running server from outside the task that owns the
/// handle, e.g. right before the process exits without unwinding.
#[derive(Debug, Clone)]
pub struct ServerKillSwitch {
    active: Arc<AtomicU32>,
}

impl ServerKillSwitch {
    /// Sends SIGKILL to the running server's process group and returns its
    /// pid. `None` when no server is running.
    pub fn kill_active(&self) -> Option<u32> {
        let pid = self.active.load(Ordering::SeqCst);
        if pid == 0 || pid == SPAWNING {
            return None;
        }
        tracing::warn!(pid, "Killing inference server process group");
        if let Err(e) = signal_group(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::error!(pid, error = %e, "Failed to kill inference server");
        }
        Some(pid)
    }
}

/// Starts, probes and stops `llama-server` processes, one at a time.
#[derive(Debug, Clone)]
pub struct ServerManager {
    config: ServerConfig,
    http_client: Client,
    active: Arc<AtomicU32>,
    metrics: MetricsCollector,
}

impl ServerManager {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let http_client = Client::builder()
            .timeout(HEALTH_PROBE_TIMEOUT)
            .build()
            .map_err(|e| ServerError::HttpClient(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
            active: Arc::new(AtomicU32::new(0)),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// True while a handle from this manager has not been stopped or dropped.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) != 0
    }

    /// A switch that kills whichever server this manager is running.
    pub fn kill_switch(&self) -> ServerKillSwitch {
        ServerKillSwitch {
            active: Arc::clone(&self.active),
        }
    }

    /// Launches the server for `files` and returns without waiting for it.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] when this manager already owns a live
    /// server, [`ServerError::SpawnFailed`] when the binary cannot be executed.
    pub fn start(&self, files: &ModelFiles) -> Result<ServerHandle, ServerError> {
        if let Err(pid) = self
            .active
            .compare_exchange(0, SPAWNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            return Err(ServerError::AlreadyRunning { pid });
        }

        match self.spawn(files) {
            Ok(handle) => {
                self.active.store(handle.pid, Ordering::SeqCst);
                self.metrics.set_server_running(true);
                Ok(handle)
            }
            Err(e) => {
                self.active.store(0, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn spawn(&self, files: &ModelFiles) -> Result<ServerHandle, ServerError> {
        let args = self.config.build_args(files);
        let binary = self.config.binary.display().to_string();

        let mut command = Command::new(&self.config.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = self.config.binary.parent().filter(|d| d.is_dir()) {
            command.current_dir(dir);
        }

        tracing::info!(binary = %binary, args = %args.join(" "), "Starting inference server");

        let mut child = command.spawn().map_err(|source| ServerError::SpawnFailed {
            binary: binary.clone(),
            source,
        })?;
        let pid = child.id().ok_or(ServerError::MissingPid)?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        Ok(ServerHandle {
            child,
            pid,
            endpoint: ServerEndpoint {
                host: self.config.host.clone(),
                port: self.config.port,
            },
            state: HealthState::Starting,
            started_at: Instant::now(),
            active: Arc::clone(&self.active),
        })
    }

    /// Polls `/health` until it answers 200.
    ///
    /// Returns false when `timeout` elapses or the process exits first; never
    /// errors.
    pub async fn wait_until_ready(&self, handle: &mut ServerHandle, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let url = handle.endpoint.health_url();

        tracing::info!(url = %url, timeout_secs = timeout.as_secs(), "Waiting for server");
        tokio::time::sleep(self.config.startup_grace.min(timeout)).await;

        loop {
            if handle.has_exited() {
                tracing::error!(pid = handle.pid, "Server exited before becoming ready");
                handle.advance(HealthState::Failed);
                return false;
            }

            if self.probe(&url).await {
                let elapsed = handle.started_at.elapsed();
                tracing::info!(startup_secs = elapsed.as_secs_f64(), "Server is ready");
                self.metrics.record_server_startup(elapsed.as_secs_f64());
                handle.advance(HealthState::Ready);
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::error!(timeout_secs = timeout.as_secs(), "Server failed to start within timeout");
                handle.advance(HealthState::Failed);
                return false;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn probe(&self, url: &str) -> bool {
        match self.http_client.get(url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::trace!(error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Terminates the server's process group and waits for the port to free.
    ///
    /// SIGTERM first; if the process is still alive after the stop timeout the
    /// group is killed. The handle is released even when an error is returned.
    pub async fn stop(&self, mut handle: ServerHandle) -> Result<(), ServerError> {
        if handle.state == HealthState::Stopped {
            return Ok(());
        }

        let outcome = self.terminate(&mut handle).await;
        handle.release();
        tokio::time::sleep(self.config.port_release_delay).await;
        tracing::info!(pid = handle.pid, "Server stopped");
        outcome
    }

    async fn terminate(&self, handle: &mut ServerHandle) -> Result<(), ServerError> {
        let pgid = handle.pgid();
        if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
            tracing::warn!(error = %e, "SIGTERM failed");
        }

        match tokio::time::timeout(self.config.stop_timeout, handle.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = handle.pid, %status, "Server exited");
                Ok(())
            }
            Ok(Err(e)) => Err(ServerError::Io(e)),
            Err(_) => {
                tracing::warn!(
                    pid = handle.pid,
                    stop_timeout_secs = self.config.stop_timeout.as_secs(),
                    "Server ignored SIGTERM, killing"
                );
                signal_group(pgid, Signal::SIGKILL)?;
                handle.child.kill().await?;
                Ok(())
            }
        }
    }

    /// Runs `f` against a ready server and always stops the server afterwards.
    ///
    /// # Errors
    ///
    /// Startup failures become [`ServerError::NotReady`] or the spawn error;
    /// otherwise the result of `f` is returned unchanged.
    pub async fn with_server<T, E, F, Fut>(&self, files: &ModelFiles, f: F) -> Result<T, E>
    where
        F: FnOnce(ServerEndpoint) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ServerError>,
    {
        let mut handle = self.start(files)?;

        if !self
            .wait_until_ready(&mut handle, self.config.ready_timeout)
            .await
        {
            if let Err(e) = self.stop(handle).await {
                tracing::warn!(error = %e, "Failed to stop server after startup failure");
            }
            return Err(ServerError::NotReady {
                timeout: self.config.ready_timeout,
            }
            .into());
        }

        let result = f(handle.endpoint.clone()).await;

        if let Err(e) = self.stop(handle).await {
            tracing::warn!(error = %e, "Failed to stop server cleanly");
        }
        result
    }
}

/// Sends `signal` to a process group. A group that no longer exists is not an
/// error.
fn signal_group(pgid: Pid, signal: Signal) -> Result<(), ServerError> {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(ServerError::Signal {
            pgid: pgid.as_raw(),
            source,
        }),
    }
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "llama_server", stream, "{}", line);
        }
    });
}
