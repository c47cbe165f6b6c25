// dumpcheck/src/tools/external.rs
use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BackupAction, BackupOutcome, BackupRequest, ClientTools, ToolOutcome};
use crate::config::{Binaries, Credentials, OperationConfig, ToolKind};
use crate::utils::find_executable;

/// Runs the real dump/restore/backup/shell executables.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    dump_bin: PathBuf,
    restore_bin: PathBuf,
    backup_bin: Option<PathBuf>,
    shell_bin: Option<PathBuf>,
}

impl ExternalTools {
    /// Locates the executables. Backup and shell tools are only required when `need_backup` is set.
    pub fn locate(binaries: &Binaries, need_backup: bool) -> Result<Self> {
        let dump_bin = find_executable(binaries.dump.as_deref(), "arangodump")?;
        let restore_bin = find_executable(binaries.restore.as_deref(), "arangorestore")?;
        let (backup_bin, shell_bin) = if need_backup {
            (
                Some(find_executable(binaries.backup.as_deref(), "arangobackup")?),
                Some(find_executable(binaries.shell.as_deref(), "arangosh")?),
            )
        } else {
            (None, None)
        };
        info!(dump = %dump_bin.display(), restore = %restore_bin.display(), "located client tools");
        Ok(ExternalTools {
            dump_bin,
            restore_bin,
            backup_bin,
            shell_bin,
        })
    }
}

fn auth_args(auth: Option<&Credentials>) -> Vec<String> {
    match auth {
        Some(creds) => vec![
            "--server.username".into(),
            creds.username.clone(),
            "--server.password".into(),
            creds.password.clone(),
        ],
        None => vec!["--server.authentication".into(), "false".into()],
    }
}

/// Pulls the snapshot name out of "... identifier '<name>' ..." lines.
fn parse_identifier(stdout: &str) -> Option<String> {
    let start = stdout.find("identifier '")? + "identifier '".len();
    let rest = &stdout[start..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

impl ClientTools for ExternalTools {
    async fn run(&self, config: &OperationConfig) -> Result<ToolOutcome> {
        let bin = match config.kind() {
            ToolKind::Dump => &self.dump_bin,
            ToolKind::Restore => &self.restore_bin,
        };
        let argv = config.to_argv();
        debug!(tool = config.kind().name(), ?argv, "executing client tool");

        let output = Command::new(bin)
            .args(&argv)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", bin.display()))?;

        Ok(ToolOutcome {
            exit_code: output.status.code(),
            status: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn backup(&self, request: &BackupRequest) -> Result<BackupOutcome> {
        let bin = self
            .backup_bin
            .as_ref()
            .context("backup executable was not located; enable scenario.hot_backup")?;

        let mut cmd = Command::new(bin);
        match request.action {
            BackupAction::Create => {
                cmd.arg("create");
                if let Some(label) = &request.label {
                    cmd.arg("--label").arg(label);
                }
            }
            BackupAction::Restore => {
                let identifier = request
                    .identifier
                    .as_ref()
                    .context("backup restore needs a snapshot identifier")?;
                cmd.arg("restore").arg("--identifier").arg(identifier);
                if let Some(wait) = request.max_wait_for_restart {
                    cmd.arg("--max-wait-for-restart").arg(wait.as_secs().to_string());
                }
            }
        }
        cmd.arg("--server.endpoint")
            .arg(&request.endpoint)
            .args(auth_args(request.auth.as_ref()))
            .arg("--log.level")
            .arg("warning");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", bin.display()))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        Ok(BackupOutcome {
            status: output.status.success(),
            identifier: parse_identifier(&stdout).or_else(|| request.identifier.clone()),
            message: if output.status.success() { stdout } else { stderr },
        })
    }

    async fn list_backups(&self, endpoint: &str, auth: Option<&Credentials>) -> Result<serde_json::Value> {
        let bin = self
            .shell_bin
            .as_ref()
            .context("shell executable was not located; enable scenario.hot_backup")?;

        let output = Command::new(bin)
            .arg("--server.endpoint")
            .arg(endpoint)
            .args(auth_args(auth))
            .arg("--quiet")
            .arg("--javascript.execute-string")
            .arg("print(JSON.stringify(arango.POST('/_admin/backup/list', {}).result.list));")
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", bin.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "listing backups failed with status: {}\nStderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).context("Failed to parse backup listing as JSON")
    }
}
