// dumpcheck/src/phase/mod.rs
pub(crate) mod script;

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use crate::config::PhaseScripts;
use crate::errors::HarnessError;
use crate::instance::{InstanceHandle, ServerProcess};

pub use script::ShellPhaseExecutor;

/// Outcome of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseResult {
    pub name: String,
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PhaseResult {
    pub fn passed(name: &str) -> Self {
        PhaseResult {
            name: name.to_string(),
            status: true,
            message: None,
        }
    }

    pub fn failed(name: &str, message: impl Into<String>) -> Self {
        PhaseResult {
            name: name.to_string(),
            status: false,
            message: Some(message.into()),
        }
    }

    pub fn from_error(name: &str, err: &anyhow::Error) -> Self {
        Self::failed(name, format!("{:#}", err))
    }

    pub fn from_result(name: &str, result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::passed(name),
            Err(e) => Self::from_error(name, &e),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// A step only passes if the server survived it: a passing step on a
    /// dead instance becomes a liveness failure.
    pub fn require_alive(self, alive: bool, instance: &str) -> Self {
        if alive || !self.status {
            return self;
        }
        Self::failed(&self.name, HarnessError::Liveness(instance.to_string()).to_string())
    }
}

/// Ambient arguments handed to a validation script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseContext {
    pub database: String,
    pub args: Vec<(String, String)>,
}

impl PhaseContext {
    pub fn new(database: impl Into<String>) -> Self {
        PhaseContext {
            database: database.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.args.push((key.to_string(), value.into()));
        self
    }

    #[cfg(test)]
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// What a validation script reported about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseVerdict {
    pub status: bool,
    pub message: Option<String>,
}

/// Runs an opaque validation script against a server.
pub trait PhaseExecutor {
    async fn execute(&self, script: &Path, endpoint: &str, context: &PhaseContext) -> Result<PhaseVerdict>;
}

pub struct PhaseRunner<E> {
    executor: E,
    scripts: PhaseScripts,
}

impl<E: PhaseExecutor> PhaseRunner<E> {
    pub fn new(executor: E, scripts: PhaseScripts) -> Self {
        PhaseRunner { executor, scripts }
    }

    pub fn has_script(&self, phase: &str) -> bool {
        self.scripts.get(phase).is_some()
    }

    /// Runs the script registered for `phase` against `instance`.
    ///
    /// Fails if the script's own checks fail, if it cannot be executed, or
    /// if the instance is not alive afterwards. A phase without a script is
    /// reported as passed with a note.
    pub async fn run<P: ServerProcess>(
        &self,
        phase: &str,
        context: &PhaseContext,
        instance: &mut InstanceHandle<P>,
    ) -> PhaseResult {
        let Some(script) = self.scripts.get(phase) else {
            warn!(phase, "no script configured, skipping phase");
            return PhaseResult::passed(phase)
                .with_message("no script configured")
                .require_alive(instance.is_alive(), instance.identity());
        };

        info!(phase, database = %context.database, script = %script.display(), "running phase");
        let result = match self.executor.execute(script, instance.endpoint(), context).await {
            Ok(PhaseVerdict { status: true, message }) => PhaseResult {
                name: phase.to_string(),
                status: true,
                message,
            },
            Ok(PhaseVerdict { status: false, message }) => PhaseResult::failed(
                phase,
                HarnessError::Validation(message.unwrap_or_else(|| "phase checks failed".to_string())).to_string(),
            ),
            Err(e) => PhaseResult::from_error(phase, &e.context(format!("could not execute phase {}", phase))),
        };
        result.require_alive(instance.is_alive(), instance.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::instance::Role;
    use crate::testkit::{FakeCluster, FakeLauncher, FakePhases};
    use crate::testkit::FakeProcess;

    async fn running_instance(cluster: &FakeCluster) -> Result<InstanceHandle<FakeProcess>> {
        let mut handle = InstanceHandle::new("primary", Role::Primary, "/tmp/p", "tcp://127.0.0.1:8529");
        handle.start(&FakeLauncher::new(cluster), &Timing::default()).await?;
        Ok(handle)
    }

    fn scripts(names: &[&str]) -> PhaseScripts {
        let mut scripts = PhaseScripts::default();
        for name in names {
            scripts.insert(name, format!("scripts/{}.js", name));
        }
        scripts
    }

    #[tokio::test]
    async fn passing_check_on_dead_server_is_a_failure() -> Result<()> {
        let cluster = FakeCluster::new();
        let mut instance = running_instance(&cluster).await?;
        cluster.crash_during_phase("validate");
        let runner = PhaseRunner::new(FakePhases::new(&cluster), scripts(&["validate"]));

        let result = runner.run("validate", &PhaseContext::new("_system"), &mut instance).await;
        assert!(!result.status);
        assert!(result.message.unwrap_or_default().contains("not alive"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_check_keeps_its_message() -> Result<()> {
        let cluster = FakeCluster::new();
        let mut instance = running_instance(&cluster).await?;
        cluster.fail_phase("validate");
        let runner = PhaseRunner::new(FakePhases::new(&cluster), scripts(&["validate"]));

        let result = runner.run("validate", &PhaseContext::new("_system"), &mut instance).await;
        assert!(!result.status);
        assert!(result.message.unwrap_or_default().contains("validation failed"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_script_is_skipped_but_still_liveness_checked() -> Result<()> {
        let cluster = FakeCluster::new();
        let mut instance = running_instance(&cluster).await?;
        let runner = PhaseRunner::new(FakePhases::new(&cluster), PhaseScripts::default());

        let result = runner.run("graph_check", &PhaseContext::new("_system"), &mut instance).await;
        assert!(result.status);
        assert_eq!(cluster.phases_run(), Vec::<String>::new());

        cluster.crash_server();
        let result = runner.run("graph_check", &PhaseContext::new("_system"), &mut instance).await;
        assert!(!result.status);
        Ok(())
    }

    #[test]
    fn context_args_are_looked_up_by_key() {
        let ctx = PhaseContext::new("db1").with_arg("expected", "100");
        assert_eq!(ctx.arg("expected"), Some("100"));
        assert_eq!(ctx.arg("missing"), None);
    }
}
