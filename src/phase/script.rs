// dumpcheck/src/phase/script.rs
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::{PhaseContext, PhaseExecutor, PhaseVerdict};
use crate::config::Credentials;

/// Lines of script output kept in a phase message.
const MESSAGE_TAIL_LINES: usize = 20;

/// Executes validation scripts with the database shell.
#[derive(Debug, Clone)]
pub struct ShellPhaseExecutor {
    shell_bin: PathBuf,
    auth: Option<Credentials>,
}

impl ShellPhaseExecutor {
    pub fn new(shell_bin: PathBuf, auth: Option<Credentials>) -> Self {
        ShellPhaseExecutor { shell_bin, auth }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

impl PhaseExecutor for ShellPhaseExecutor {
    async fn execute(&self, script: &Path, endpoint: &str, context: &PhaseContext) -> Result<PhaseVerdict> {
        let mut cmd = Command::new(&self.shell_bin);
        cmd.arg("--server.endpoint")
            .arg(endpoint)
            .arg("--server.database")
            .arg(&context.database);
        match &self.auth {
            Some(creds) => {
                cmd.arg("--server.username")
                    .arg(&creds.username)
                    .arg("--server.password")
                    .arg(&creds.password);
            }
            None => {
                cmd.arg("--server.authentication").arg("false");
            }
        }
        cmd.arg("--javascript.execute").arg(script);
        if !context.args.is_empty() {
            cmd.arg("--");
            for (key, value) in &context.args {
                cmd.arg(format!("{}={}", key, value));
            }
        }
        debug!(script = %script.display(), database = %context.database, "executing phase script");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute {} for {}", self.shell_bin.display(), script.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if output.status.success() {
            None
        } else {
            let mut text = tail(&stdout, MESSAGE_TAIL_LINES);
            if !stderr.trim().is_empty() {
                text.push('\n');
                text.push_str(&tail(&stderr, MESSAGE_TAIL_LINES));
            }
            Some(format!("{} exited with {}: {}", script.display(), output.status, text.trim()))
        };
        Ok(PhaseVerdict {
            status: output.status.success(),
            message,
        })
    }
}
