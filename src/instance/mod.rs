// dumpcheck/src/instance/mod.rs
pub(crate) mod local;

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::errors::HarnessError;

pub use local::LocalServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Crashed,
    Stopped,
}

/// Everything a launcher needs to bring up one server.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub identity: String,
    pub role: Role,
    pub root_dir: PathBuf,
    pub endpoint: String,
}

/// A spawned server process, as seen by the harness.
pub trait ServerProcess {
    /// Non-blocking check whether the process has not exited.
    fn is_running(&mut self) -> bool;

    /// Opens a fresh client session against the server.
    async fn connect(&mut self) -> Result<()>;

    /// Asks the server to shut down and waits for it to exit.
    async fn shutdown(&mut self, timeout: Duration) -> Result<()>;

    /// Terminates the process without asking.
    async fn kill(&mut self) -> Result<()>;
}

pub trait ServerLauncher {
    type Process: ServerProcess;

    async fn launch(&self, spec: &LaunchSpec) -> Result<Self::Process>;
}

/// One server instance owned by the orchestrator.
pub struct InstanceHandle<P> {
    identity: String,
    role: Role,
    root_dir: PathBuf,
    endpoint: String,
    state: ProcessState,
    process: Option<P>,
    started_at: Option<Instant>,
    last_error: Option<String>,
}

impl<P: ServerProcess> InstanceHandle<P> {
    pub fn new(identity: impl Into<String>, role: Role, root_dir: impl Into<PathBuf>, endpoint: impl Into<String>) -> Self {
        InstanceHandle {
            identity: identity.into(),
            role,
            root_dir: root_dir.into(),
            endpoint: endpoint.into(),
            state: ProcessState::NotStarted,
            process: None,
            started_at: None,
            last_error: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Error that forced the last shutdown, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn uptime(&self) -> Option<Duration> {
        match self.state {
            ProcessState::Running => self.started_at.map(|t| t.elapsed()),
            _ => None,
        }
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            identity: self.identity.clone(),
            role: self.role,
            root_dir: self.root_dir.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Launches the server, waits until it accepts a session and marks it running.
    ///
    /// Failure here is never retried.
    pub async fn start<L>(&mut self, launcher: &L, timing: &Timing) -> std::result::Result<(), HarnessError>
    where
        L: ServerLauncher<Process = P>,
    {
        info!(instance = %self.identity, role = ?self.role, endpoint = %self.endpoint, "starting server");
        let mut process = launcher.launch(&self.launch_spec()).await.map_err(|e| {
            self.state = ProcessState::Crashed;
            HarnessError::Startup(format!("{:#}", e))
        })?;

        let deadline = Instant::now() + timing.startup_timeout();
        loop {
            if !process.is_running() {
                self.state = ProcessState::Crashed;
                return Err(HarnessError::Startup(format!("{} exited during startup", self.identity)));
            }
            match process.connect().await {
                Ok(()) => break,
                Err(e) if Instant::now() >= deadline => {
                    if let Err(kill_err) = process.kill().await {
                        warn!(instance = %self.identity, error = %kill_err, "failed to kill unresponsive server");
                    }
                    self.state = ProcessState::Crashed;
                    return Err(HarnessError::Startup(format!(
                        "{} did not become ready within {:?}: {:#}",
                        self.identity,
                        timing.startup_timeout(),
                        e
                    )));
                }
                Err(e) => {
                    debug!(instance = %self.identity, error = %e, "server not ready yet");
                    tokio::time::sleep(timing.poll_interval).await;
                }
            }
        }

        self.process = Some(process);
        self.state = ProcessState::Running;
        self.started_at = Some(Instant::now());
        self.last_error = None;
        info!(instance = %self.identity, "server is up");
        Ok(())
    }

    /// Non-blocking liveness probe. A running instance whose process vanished becomes `Crashed`.
    pub fn is_alive(&mut self) -> bool {
        if self.state != ProcessState::Running {
            return false;
        }
        let running = self.process.as_mut().is_some_and(|p| p.is_running());
        if !running {
            warn!(instance = %self.identity, "server process is gone");
            self.state = ProcessState::Crashed;
        }
        running
    }

    pub async fn reconnect(&mut self) -> Result<()> {
        let process = self
            .process
            .as_mut()
            .with_context(|| format!("{} has no process to reconnect to", self.identity))?;
        process
            .connect()
            .await
            .with_context(|| format!("Failed to reconnect to {}", self.identity))
    }

    /// Polls until the server answers again or the budget runs out. Used after
    /// operations that bounce the process in place.
    pub async fn wait_alive(&mut self, budget: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            let running = self.process.as_mut().is_some_and(|p| p.is_running());
            if running {
                if let Some(process) = self.process.as_mut() {
                    if process.connect().await.is_ok() {
                        self.state = ProcessState::Running;
                        return true;
                    }
                }
            }
            if Instant::now() >= deadline {
                warn!(instance = %self.identity, ?budget, "server did not come back in time");
                self.state = if running { ProcessState::Running } else { ProcessState::Crashed };
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stops the server: reconnect then graceful shutdown, falling back to a
    /// kill on any error (recorded in `last_error`). Stopping a stopped or
    /// never-started instance succeeds without doing anything.
    pub async fn stop(&mut self, force: bool, timing: &Timing) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            if self.state != ProcessState::NotStarted {
                self.state = ProcessState::Stopped;
            }
            return Ok(());
        };
        if let Some(uptime) = self.uptime() {
            info!(instance = %self.identity, uptime_secs = uptime.as_secs(), "stopping server");
        }

        let graceful = if force {
            Err(anyhow::anyhow!("forced shutdown requested"))
        } else if !process.is_running() {
            Ok(())
        } else {
            match process.connect().await {
                Ok(()) => process.shutdown(timing.shutdown_timeout()).await,
                Err(e) => Err(e.context("reconnect before shutdown failed")),
            }
        };

        let result = match graceful {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(instance = %self.identity, error = %reason, "graceful shutdown failed, killing server");
                self.last_error = Some(reason);
                process
                    .kill()
                    .await
                    .with_context(|| format!("Failed to kill server {}", self.identity))
            }
        };
        self.state = ProcessState::Stopped;
        self.started_at = None;
        result
    }
}
