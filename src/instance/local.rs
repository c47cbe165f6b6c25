// dumpcheck/src/instance/local.rs
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::info;

use super::{LaunchSpec, ServerLauncher, ServerProcess};
use crate::utils;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Launches database servers as local child processes.
#[derive(Debug, Clone)]
pub struct LocalServer {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl LocalServer {
    pub fn new(binary: PathBuf, extra_args: Vec<String>) -> Self {
        LocalServer { binary, extra_args }
    }
}

pub struct LocalProcess {
    child: Child,
    address: String,
}

impl ServerLauncher for LocalServer {
    type Process = LocalProcess;

    async fn launch(&self, spec: &LaunchSpec) -> Result<LocalProcess> {
        let data_dir = spec.root_dir.join("data");
        let apps_dir = spec.root_dir.join("apps");
        utils::create_dir(&data_dir)?;
        utils::create_dir(&apps_dir)?;
        let address = utils::endpoint_address(&spec.endpoint)?;
        let log_file = spec.root_dir.join("server.log");

        info!(
            instance = %spec.identity,
            binary = %self.binary.display(),
            root = %spec.root_dir.display(),
            "launching server process"
        );
        let child = Command::new(&self.binary)
            .arg("--server.endpoint")
            .arg(&spec.endpoint)
            .arg("--database.directory")
            .arg(&data_dir)
            .arg("--javascript.app-path")
            .arg(&apps_dir)
            .arg("--log.file")
            .arg(&log_file)
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn server {} for {}", self.binary.display(), spec.identity))?;

        Ok(LocalProcess { child, address })
    }
}

impl ServerProcess for LocalProcess {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn connect(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .with_context(|| format!("Timed out connecting to {}", self.address))?
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        drop(stream);
        Ok(())
    }

    async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let pid = self
            .child
            .id()
            .context("Server process has already been reaped")?;
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await
            .context("Failed to execute kill for graceful shutdown")?;
        if !status.success() {
            anyhow::bail!("kill -TERM {} failed with status {}", pid, status);
        }

        let exit = tokio::time::timeout(timeout, self.child.wait())
            .await
            .with_context(|| format!("Server {} did not exit within {:?}", pid, timeout))?
            .context("Failed to wait for server exit")?;
        if !exit.success() {
            anyhow::bail!("Server {} exited with {} during shutdown", pid, exit);
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.child.kill().await.context("Failed to kill server process")
    }
}
