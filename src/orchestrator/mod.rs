// dumpcheck/src/orchestrator/mod.rs
pub(crate) mod logic;
pub mod report;

use anyhow::{Context, Result};
use std::fs;
use tracing::info;

use crate::config::HarnessConfig;
use crate::instance::LocalServer;
use crate::phase::ShellPhaseExecutor;
use crate::tools::ExternalTools;
use crate::utils::{self, find_executable};

pub use logic::Orchestrator;
pub use report::RunReport;

/// Public entry point for a validation run against locally spawned servers.
/// The report is also written to `<work_dir>/report.json`.
pub async fn run_validation_flow(config: HarnessConfig) -> Result<RunReport> {
    let server_bin = find_executable(config.binaries.server.as_deref(), "arangod")?;
    let shell_bin = find_executable(config.binaries.shell.as_deref(), "arangosh")?;
    let tools = ExternalTools::locate(&config.binaries, config.scenario.hot_backup)
        .context("Failed to locate client tools")?;
    let launcher = LocalServer::new(server_bin, config.server_args.clone());
    let executor = ShellPhaseExecutor::new(shell_bin, config.auth.clone());

    let work_dir = config.work_dir.clone();
    utils::create_dir(&work_dir)?;
    info!(work_dir = %work_dir.display(), scenario = ?config.scenario, "starting validation run");

    let report = Orchestrator::new(config, launcher, tools, executor).run().await;

    let report_path = work_dir.join("report.json");
    let body = serde_json::to_string_pretty(&report).context("Failed to serialize run report")?;
    fs::write(&report_path, body)
        .with_context(|| format!("Failed to write run report to {}", report_path.display()))?;
    info!(report = %report_path.display(), failed = report.failed, "validation run finished");
    Ok(report)
}
