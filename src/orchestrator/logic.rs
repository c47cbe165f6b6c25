// dumpcheck/src/orchestrator/logic.rs
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::report::{PipelineRun, RunReport};
use crate::backup::{BackupCatalog, key_fingerprint};
use crate::config::{HarnessConfig, OperationConfig, ToolKind};
use crate::errors::HarnessError;
use crate::instance::{InstanceHandle, Role, ServerLauncher, ServerProcess};
use crate::phase::{PhaseContext, PhaseExecutor, PhaseResult, PhaseRunner};
use crate::retry::RetryableOperation;
use crate::tools::ClientTools;
use crate::utils;

pub const STARTUP: &str = "startup";
pub const CONFIGURE: &str = "configure";
pub const SETUP: &str = "setup";
pub const SEED: &str = "seed";
pub const DUMP: &str = "dump";
pub const CLEAN: &str = "clean";
pub const RESTART: &str = "restart";
pub const RESTORE: &str = "restore";
pub const VALIDATE: &str = "validate";
pub const GRAPH_CHECK: &str = "graph_check";
pub const FOXX_APPS_FIRST: &str = "foxx_apps_first";
pub const FOXX_BUNDLES_FIRST: &str = "foxx_bundles_first";
pub const FOXX_CHECK: &str = "foxx_check";
pub const CREATE_BACKUP: &str = "create_backup";
pub const MUTATE: &str = "mutate";
pub const RECHECK_BEFORE: &str = "recheck_before";
pub const RESTORE_BACKUP: &str = "restore_backup";
pub const RECHECK_AFTER: &str = "recheck_after";
pub const TEARDOWN: &str = "teardown";

const FOXX_APPS: &str = "_apps";
const FOXX_BUNDLES: &str = "_appbundles";

/// Per-role tool configurations, built once the primary is bound.
#[derive(Debug, Clone)]
struct RoleConfigs {
    dump: OperationConfig,
    restore_primary: OperationConfig,
    restore_secondary: OperationConfig,
}

/// Primary instance plus the secondary that replaces it in mixed-topology runs.
struct Instances<P> {
    primary: InstanceHandle<P>,
    secondary: Option<InstanceHandle<P>>,
}

impl<P: ServerProcess> Instances<P> {
    fn active(&mut self) -> &mut InstanceHandle<P> {
        match self.secondary.as_mut() {
            Some(secondary) => secondary,
            None => &mut self.primary,
        }
    }

    fn active_endpoint(&self) -> &str {
        self.secondary.as_ref().unwrap_or(&self.primary).endpoint()
    }

    fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }
}

/// Drives one dump/restore validation run from first server start to teardown.
pub struct Orchestrator<L: ServerLauncher, T, E> {
    config: HarnessConfig,
    launcher: L,
    tools: T,
    phases: PhaseRunner<E>,
    instances: Instances<L::Process>,
    roles: Option<RoleConfigs>,
    /// Private to this run: instance roots, dump output and key material live below it.
    run_dir: PathBuf,
    fault_injection_disabled: bool,
}

impl<L, T, E> Orchestrator<L, T, E>
where
    L: ServerLauncher,
    T: ClientTools,
    E: PhaseExecutor,
{
    pub fn new(config: HarnessConfig, launcher: L, tools: T, executor: E) -> Self {
        let run_dir = config.work_dir.join(format!("run-{}", Uuid::new_v4().simple()));
        let primary = InstanceHandle::new(
            "primary",
            Role::Primary,
            run_dir.join("primary"),
            config.primary_endpoint.clone(),
        );
        let phases = PhaseRunner::new(executor, config.phases.clone());
        Orchestrator {
            config,
            launcher,
            tools,
            phases,
            instances: Instances {
                primary,
                secondary: None,
            },
            roles: None,
            run_dir,
            fault_injection_disabled: false,
        }
    }

    fn dump_dir(&self) -> PathBuf {
        self.run_dir.join("dump")
    }

    /// Runs the whole pipeline. Never fails: every problem ends up in the report.
    pub async fn run(mut self) -> RunReport {
        let mut run = PipelineRun::new();

        if let Err(e) = self
            .instances
            .primary
            .start(&self.launcher, &self.config.timing)
            .await
        {
            error!(error = %e, "primary server did not start");
            run.record(PhaseResult::failed(STARTUP, "failed to start server"));
            return run.finish();
        }
        run.record(PhaseResult::passed(STARTUP));

        self.drive(&mut run).await;
        self.teardown(&mut run).await;
        run.finish()
    }

    /// Guards a step result with the active instance's liveness and records it.
    fn settle(&mut self, run: &mut PipelineRun, result: PhaseResult) -> bool {
        let active = self.instances.active();
        let alive = active.is_alive();
        let result = result.require_alive(alive, active.identity());
        run.record(result)
    }

    fn phase_context(&self, database: &str) -> PhaseContext {
        let mut ctx = PhaseContext::new(database);
        if self.config.scenario.all_databases || self.config.scenario.per_database_dump {
            ctx = ctx.with_arg("databases", self.config.databases.join(","));
        }
        ctx
    }

    async fn run_phase(&mut self, phase: &str) -> PhaseResult {
        let ctx = self.phase_context(&self.config.database);
        self.phases.run(phase, &ctx, self.instances.active()).await
    }

    async fn drive(&mut self, run: &mut PipelineRun) {
        let result = PhaseResult::from_result(CONFIGURE, self.configure());
        if !self.settle(run, result) {
            return;
        }

        for phase in [SETUP, SEED] {
            let result = self.run_phase(phase).await;
            if !self.settle(run, result) {
                return;
            }
        }

        let result = self.dump(run).await;
        if !self.settle(run, result) {
            return;
        }

        let result = self.run_phase(CLEAN).await;
        if !self.settle(run, result) {
            return;
        }

        if self.config.scenario.restart_between {
            let result = self.restart().await;
            if !self.settle(run, result) {
                return;
            }
        }

        let result = self.restore(run).await;
        if !self.settle(run, result) {
            return;
        }

        let result = self.run_phase(VALIDATE).await;
        if !self.settle(run, result) {
            return;
        }

        if self.config.scenario.graph_check {
            let result = self.run_phase(GRAPH_CHECK).await;
            if !self.settle(run, result) {
                return;
            }
        }

        if self.config.scenario.foxx {
            for (name, order) in [
                (FOXX_APPS_FIRST, [FOXX_APPS, FOXX_BUNDLES]),
                (FOXX_BUNDLES_FIRST, [FOXX_BUNDLES, FOXX_APPS]),
            ] {
                let result = self.foxx_variant(run, name, order).await;
                if !self.settle(run, result) {
                    return;
                }
            }
        }

        if self.config.scenario.hot_backup {
            self.hot_backup(run).await;
        }
    }

    /// Writes key material and builds the per-role tool configurations.
    fn configure(&mut self) -> Result<()> {
        utils::create_dir(&self.run_dir)?;
        let scenario = self.config.scenario;

        let mut dump = OperationConfig::new(ToolKind::Dump, self.instances.primary.endpoint(), self.dump_dir())
            .with_auth(self.config.auth.clone())
            .with_threads(self.config.threads)
            .with_include_system(true)
            .with_compression(scenario.compress_output);
        let mut restore = OperationConfig::new(ToolKind::Restore, self.instances.primary.endpoint(), self.dump_dir())
            .with_auth(self.config.auth.clone())
            .with_threads(self.config.threads)
            .with_include_system(true)
            .with_create_database(true)
            .with_fault_injection(scenario.fault_injection);

        if let Some(key) = self.config.encryption_key.clone() {
            let dump_key = utils::write_key_file(&self.run_dir.join("dump-key"), &key)?;
            let restore_key = utils::write_key_file(&self.run_dir.join("restore-key"), &key)?;
            dump = dump.with_encryption(dump_key);
            restore = restore.with_encryption(restore_key);
        }

        if scenario.all_databases && !scenario.per_database_dump {
            dump = dump.set_all_databases();
            restore = restore.set_all_databases();
        } else {
            dump = dump.set_database(&self.config.database);
            restore = restore.set_database(&self.config.database);
        }

        let restore_secondary = restore.clone().with_endpoint(self.config.secondary_endpoint.clone());
        info!(run_dir = %self.run_dir.display(), encrypted = dump.encryption().enabled, "tool configuration ready");
        self.roles = Some(RoleConfigs {
            dump,
            restore_primary: restore,
            restore_secondary,
        });
        Ok(())
    }

    fn roles(&self) -> Result<&RoleConfigs> {
        self.roles.as_ref().context("tool configuration was not built")
    }

    fn active_restore(&self) -> Result<OperationConfig> {
        let roles = self.roles()?;
        Ok(if self.instances.has_secondary() {
            roles.restore_secondary.clone()
        } else {
            roles.restore_primary.clone()
        })
    }

    /// Runs tool invocations in order through the fault retry loop.
    async fn run_tools(&mut self, run: &mut PipelineRun, step: &str, configs: Vec<OperationConfig>) -> Result<()> {
        let backoff = self.config.timing.retry_backoff();
        for config in configs {
            let config = if self.fault_injection_disabled {
                config.with_fault_injection(false)
            } else {
                config
            };
            info!(step, tool = config.kind().name(), selection = ?config.selection(), "invoking client tool");
            let report = RetryableOperation::new(&self.tools, backoff)
                .run(&config, self.instances.active())
                .await;
            run.note_retries(step, report.retries);

            if report.fault_injection_disabled {
                self.fault_injection_disabled = true;
                if let Some(roles) = self.roles.as_mut() {
                    roles.restore_primary = roles.restore_primary.clone().with_fault_injection(false);
                    roles.restore_secondary = roles.restore_secondary.clone().with_fault_injection(false);
                }
            }
            let outcome = report.outcome?;
            if !outcome.status {
                return Err(HarnessError::Tool {
                    tool: config.kind().name().to_string(),
                    exit_code: outcome.exit_code,
                    stderr: outcome.stderr.trim().to_string(),
                }
                .into());
            }
            if config.kind() == ToolKind::Dump {
                let dir = config.directory();
                if utils::count_files(&dir)? == 0 {
                    anyhow::bail!("dump produced no files in {}", dir.display());
                }
            }
        }
        Ok(())
    }

    async fn dump(&mut self, run: &mut PipelineRun) -> PhaseResult {
        let configs: Vec<OperationConfig> = match self.roles() {
            Ok(roles) if self.config.scenario.per_database_dump => self
                .config
                .databases
                .iter()
                .map(|db| roles.dump.clone().for_database_directory(db))
                .collect(),
            Ok(roles) => vec![roles.dump.clone()],
            Err(e) => return PhaseResult::from_error(DUMP, &e),
        };
        info!(invocations = configs.len(), "dumping");
        PhaseResult::from_result(DUMP, self.run_tools(run, DUMP, configs).await)
    }

    /// Replaces the primary with a freshly started secondary instance.
    async fn restart(&mut self) -> PhaseResult {
        let timing = self.config.timing;
        if let Err(e) = self.instances.primary.stop(false, &timing).await {
            return PhaseResult::from_error(RESTART, &e.context("failed to stop primary"));
        }
        let mut secondary = InstanceHandle::new(
            "secondary",
            Role::Secondary,
            self.run_dir.join("secondary"),
            self.config.secondary_endpoint.clone(),
        );
        let started = secondary.start(&self.launcher, &timing).await;
        self.instances.secondary = Some(secondary);
        match started {
            Ok(()) => PhaseResult::passed(RESTART),
            Err(e) => {
                error!(error = %e, "secondary server did not start");
                PhaseResult::failed(RESTART, "failed to start server")
            }
        }
    }

    async fn restore(&mut self, run: &mut PipelineRun) -> PhaseResult {
        let base = match self.active_restore() {
            Ok(cfg) => cfg,
            Err(e) => return PhaseResult::from_error(RESTORE, &e),
        };
        let configs: Vec<OperationConfig> = if self.config.scenario.per_database_dump {
            self.config
                .databases
                .iter()
                .map(|db| base.clone().for_database_directory(db))
                .collect()
        } else {
            vec![base]
        };
        info!(invocations = configs.len(), "restoring");
        PhaseResult::from_result(RESTORE, self.run_tools(run, RESTORE, configs).await)
    }

    /// Restores the application catalog one collection at a time in `order`,
    /// then checks it.
    async fn foxx_variant(&mut self, run: &mut PipelineRun, name: &str, order: [&str; 2]) -> PhaseResult {
        let base = match self.active_restore() {
            Ok(cfg) => cfg,
            Err(e) => return PhaseResult::from_error(name, &e),
        };
        let foxx_db = self.config.foxx_database.clone();
        let scenario = self.config.scenario;
        let base = if scenario.all_databases || scenario.per_database_dump {
            base.for_database_directory(&foxx_db)
        } else {
            base.set_database(&foxx_db)
        };
        let configs = order
            .iter()
            .map(|&collection| base.clone().restrict_to_collection(Some(collection)))
            .collect();
        info!(variant = name, first = order[0], second = order[1], "restoring application catalog");

        if let Err(e) = self.run_tools(run, name, configs).await {
            return PhaseResult::from_error(name, &e);
        }
        let ctx = PhaseContext::new(&foxx_db).with_arg("order", order.join(","));
        let check = self.phases.run(FOXX_CHECK, &ctx, self.instances.active()).await;
        PhaseResult {
            name: name.to_string(),
            ..check
        }
    }

    /// create backup -> mutate -> recheck -> restore backup -> recheck
    async fn hot_backup(&mut self, run: &mut PipelineRun) {
        let label = self.config.backup_label.clone();

        let result = match self.catalog().create(&label).await {
            Ok(name) => PhaseResult::passed(CREATE_BACKUP).with_message(name),
            Err(e) => PhaseResult::from_error(CREATE_BACKUP, &e),
        };
        if !self.settle(run, result) {
            return;
        }

        for phase in [MUTATE, RECHECK_BEFORE] {
            let result = self.run_phase(phase).await;
            if !self.settle(run, result) {
                return;
            }
        }

        let result = self.restore_backup(&label).await;
        if !self.settle(run, result) {
            return;
        }

        let result = self.run_phase(RECHECK_AFTER).await;
        self.settle(run, result);
    }

    fn catalog(&self) -> BackupCatalog<'_, T> {
        BackupCatalog::new(&self.tools, self.instances.active_endpoint(), self.config.auth.clone())
    }

    async fn restore_backup(&mut self, label: &str) -> PhaseResult {
        let fingerprints: Vec<String> = self.config.encryption_key.as_deref().map(key_fingerprint).into_iter().collect();
        let wait = self.config.timing.backup_restore_wait();
        let poll = self.config.timing.poll_interval;

        let restored = self.catalog().restore_latest(label, &fingerprints, wait).await;
        let snapshot = match restored {
            Ok(snapshot) => snapshot,
            Err(e) => return PhaseResult::from_error(RESTORE_BACKUP, &e),
        };

        // the restore bounces the server in place
        let active = self.instances.active();
        if !active.wait_alive(wait, poll).await {
            return PhaseResult::failed(
                RESTORE_BACKUP,
                HarnessError::Liveness(active.identity().to_string()).to_string(),
            );
        }
        if let Err(e) = active.reconnect().await {
            return PhaseResult::from_error(RESTORE_BACKUP, &e);
        }
        PhaseResult::passed(RESTORE_BACKUP).with_message(snapshot.name)
    }

    /// Best effort: every part runs, problems are collected into one teardown result.
    async fn teardown(&mut self, run: &mut PipelineRun) {
        let succeeded = !run.halted();
        let timing = self.config.timing;
        let mut problems = Vec::new();

        if self.phases.has_script(TEARDOWN) {
            if self.instances.active().is_alive() {
                let result = self.run_phase(TEARDOWN).await;
                if !result.status {
                    problems.push(result.message.unwrap_or_else(|| "teardown script failed".to_string()));
                }
            } else {
                warn!("skipping teardown script, server is not alive");
            }
        }

        if let Some(secondary) = self.instances.secondary.as_mut() {
            if let Err(e) = secondary.stop(false, &timing).await {
                problems.push(format!("{:#}", e));
            }
        }
        if let Err(e) = self.instances.primary.stop(false, &timing).await {
            problems.push(format!("{:#}", e));
        }
        for handle in std::iter::once(&self.instances.primary).chain(self.instances.secondary.as_ref()) {
            match handle.last_error() {
                Some(reason) => warn!(
                    instance = handle.identity(),
                    root = %handle.root_dir().display(),
                    state = ?handle.state(),
                    reason,
                    "server was killed"
                ),
                None => info!(
                    instance = handle.identity(),
                    root = %handle.root_dir().display(),
                    state = ?handle.state(),
                    "server stopped"
                ),
            }
        }

        if succeeded && problems.is_empty() && self.config.cleanup {
            if let Err(e) = utils::remove_dir(&self.run_dir) {
                problems.push(format!("{:#}", e));
            }
        } else if !succeeded {
            info!(run_dir = %self.run_dir.display(), "keeping run directory for inspection");
        }

        let result = if problems.is_empty() {
            PhaseResult::passed(TEARDOWN)
        } else {
            PhaseResult::failed(TEARDOWN, HarnessError::Teardown(problems.join("; ")).to_string())
        };
        run.record_teardown(result);
    }
}
