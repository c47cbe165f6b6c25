// dumpcheck/src/tools/mod.rs
pub(crate) mod external;

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;

use crate::config::{Credentials, OperationConfig};

pub use external::ExternalTools;

/// Exit status the restore tool uses when it stops itself at an injected
/// fault point. Any other non-zero status is a genuine failure.
pub const FAULT_INJECTED_EXIT_CODE: i32 = 38;

/// Result of one dump or restore invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutcome {
    pub exit_code: Option<i32>,
    pub status: bool,
    pub stderr: String,
}

impl ToolOutcome {
    #[cfg(test)]
    pub fn success() -> Self {
        ToolOutcome {
            exit_code: Some(0),
            status: true,
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        ToolOutcome {
            exit_code,
            status: false,
            stderr: stderr.into(),
        }
    }

    #[cfg(test)]
    pub fn fault_injected() -> Self {
        Self::failure(Some(FAULT_INJECTED_EXIT_CODE), "triggered failure point")
    }

    pub fn is_fault_signal(&self) -> bool {
        !self.status && self.exit_code == Some(FAULT_INJECTED_EXIT_CODE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupAction {
    Create,
    Restore,
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub action: BackupAction,
    pub endpoint: String,
    pub auth: Option<Credentials>,
    /// Label attached on create.
    pub label: Option<String>,
    /// Snapshot name to restore.
    pub identifier: Option<String>,
    pub max_wait_for_restart: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub status: bool,
    pub identifier: Option<String>,
    pub message: String,
}

/// The external client executables driven by the harness.
pub trait ClientTools {
    /// Runs the dump or restore tool, depending on `config.kind()`.
    async fn run(&self, config: &OperationConfig) -> Result<ToolOutcome>;

    async fn backup(&self, request: &BackupRequest) -> Result<BackupOutcome>;

    /// Raw backup listing: an object mapping snapshot names to their metadata.
    async fn list_backups(&self, endpoint: &str, auth: Option<&Credentials>) -> Result<serde_json::Value>;
}
