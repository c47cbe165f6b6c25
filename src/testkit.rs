// dumpcheck/src/testkit.rs
//! In-process stand-ins for the server, the client tools and the validation
//! scripts. Dumps are written to real directories so the harness' own file
//! checks see them.
use anyhow::{Context, Result};
use serde_json::json;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use crate::backup::key_fingerprint;
use crate::config::{Credentials, DatabaseSelection, OperationConfig, ToolKind};
use crate::instance::{LaunchSpec, ServerLauncher, ServerProcess};
use crate::phase::{PhaseContext, PhaseExecutor, PhaseVerdict};
use crate::tools::{BackupAction, BackupOutcome, BackupRequest, ClientTools, ToolOutcome};

pub const SEED_COUNT: u64 = 100;
pub const MUTATION: u64 = 10;

type Dataset = BTreeMap<String, u64>;

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub kind: ToolKind,
    pub endpoint: String,
    pub selection: DatabaseSelection,
    pub collection: Option<String>,
    pub continuation: bool,
    pub fault_injection: bool,
}

#[derive(Debug, Clone)]
struct Snapshot {
    name: String,
    fingerprints: Vec<String>,
    data: Dataset,
}

#[derive(Default)]
struct ClusterState {
    alive: HashMap<String, bool>,
    data: HashMap<String, Dataset>,
    launches: Vec<String>,
    failing_launches: u32,
    failing_identities: HashSet<String>,
    fail_shutdown: bool,
    unreachable: bool,
    kills: u32,
    faults_remaining: u32,
    fault_unconditionally: bool,
    crash_on_restore: bool,
    calls: Vec<ToolCall>,
    backup_key: Option<String>,
    snapshots: Vec<Snapshot>,
    backup_restores: u32,
    failing_phases: HashSet<String>,
    crashing_phases: HashSet<String>,
    unreachable_after: HashSet<String>,
    phases_run: Vec<String>,
}

/// Shared state behind every fake collaborator.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Rc<RefCell<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_launch(&self) {
        self.state.borrow_mut().failing_launches += 1;
    }

    /// Launches of the instance with this identity fail.
    pub fn fail_launch_of(&self, identity: &str) {
        self.state.borrow_mut().failing_identities.insert(identity.to_string());
    }

    pub fn fail_shutdown(&self) {
        self.state.borrow_mut().fail_shutdown = true;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.borrow_mut().unreachable = unreachable;
    }

    pub fn crash_server(&self) {
        let mut state = self.state.borrow_mut();
        for alive in state.alive.values_mut() {
            *alive = false;
        }
    }

    /// The next `n` restores invoked with fault injection exit with the fault code.
    /// Faults are served before a configured restore crash.
    pub fn fault_restores(&self, n: u32) {
        self.state.borrow_mut().faults_remaining = n;
    }

    /// Like `fault_restores`, but regardless of the fault injection flag.
    pub fn fault_restores_unconditionally(&self, n: u32) {
        let mut state = self.state.borrow_mut();
        state.faults_remaining = n;
        state.fault_unconditionally = true;
    }

    pub fn crash_on_restore(&self) {
        self.state.borrow_mut().crash_on_restore = true;
    }

    pub fn set_backup_key(&self, key: Option<&str>) {
        self.state.borrow_mut().backup_key = key.map(str::to_string);
    }

    pub fn fail_phase(&self, phase: &str) {
        self.state.borrow_mut().failing_phases.insert(phase.to_string());
    }

    pub fn crash_during_phase(&self, phase: &str) {
        self.state.borrow_mut().crashing_phases.insert(phase.to_string());
    }

    /// Once `phase` has run, the server process stays up but stops accepting sessions.
    pub fn unreachable_after_phase(&self, phase: &str) {
        self.state.borrow_mut().unreachable_after.insert(phase.to_string());
    }

    pub fn kills(&self) -> u32 {
        self.state.borrow().kills
    }

    pub fn launches(&self) -> Vec<String> {
        self.state.borrow().launches.clone()
    }

    pub fn backup_restores(&self) -> u32 {
        self.state.borrow().backup_restores
    }

    pub fn phases_run(&self) -> Vec<String> {
        self.state.borrow().phases_run.clone()
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.state.borrow().calls.clone()
    }

    pub fn restore_calls(&self) -> Vec<ToolCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == ToolKind::Restore)
            .collect()
    }

    pub fn documents(&self, endpoint: &str, database: &str) -> u64 {
        self.state
            .borrow()
            .data
            .get(endpoint)
            .and_then(|d| d.get(database))
            .copied()
            .unwrap_or(0)
    }

    /// Writes a single-database dump into `dir`, as the dump tool would.
    pub fn write_dump(&self, dir: &Path, database: &str, count: u64) -> Result<()> {
        fs::create_dir_all(dir)?;
        let body = json!({ "database": database, "count": count });
        fs::write(dir.join("data.json"), body.to_string())?;
        Ok(())
    }

    fn read_dump(dir: &Path) -> Result<u64> {
        let text = fs::read_to_string(dir.join("data.json"))
            .with_context(|| format!("no dump in {}", dir.display()))?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        value["count"].as_u64().context("dump without count")
    }

    fn is_alive(&self, endpoint: &str) -> bool {
        self.state.borrow().alive.get(endpoint).copied().unwrap_or(false)
    }

    fn dump(&self, config: &OperationConfig) -> Result<ToolOutcome> {
        let dataset = self
            .state
            .borrow()
            .data
            .get(config.endpoint())
            .cloned()
            .unwrap_or_default();
        let dir = config.directory();
        match config.selection() {
            DatabaseSelection::All => {
                for (db, count) in &dataset {
                    self.write_dump(&dir.join(db), db, *count)?;
                }
            }
            DatabaseSelection::Single(db) => {
                let count = dataset.get(db).copied().unwrap_or(0);
                self.write_dump(&dir, db, count)?;
            }
        }
        Ok(ToolOutcome::success())
    }

    fn restore(&self, config: &OperationConfig) -> Result<ToolOutcome> {
        {
            let mut state = self.state.borrow_mut();
            if state.faults_remaining > 0 && (config.fault_injection() || state.fault_unconditionally) {
                state.faults_remaining -= 1;
                return Ok(ToolOutcome::fault_injected());
            }
            if state.crash_on_restore {
                for alive in state.alive.values_mut() {
                    *alive = false;
                }
                return Ok(ToolOutcome::failure(None, "connection lost"));
            }
        }
        if config.collection().is_some() {
            return Ok(ToolOutcome::success());
        }

        let dir = config.directory();
        let mut restored = Dataset::new();
        match config.selection() {
            DatabaseSelection::All => {
                let entries = match fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) => return Ok(ToolOutcome::failure(Some(1), e.to_string())),
                };
                for entry in entries {
                    let entry = entry?;
                    if entry.path().is_dir() {
                        let db = entry.file_name().to_string_lossy().into_owned();
                        restored.insert(db, Self::read_dump(&entry.path())?);
                    }
                }
            }
            DatabaseSelection::Single(db) => match Self::read_dump(&dir) {
                Ok(count) => {
                    restored.insert(db.clone(), count);
                }
                Err(e) => return Ok(ToolOutcome::failure(Some(1), format!("{:#}", e))),
            },
        }
        let mut state = self.state.borrow_mut();
        let target = state.data.entry(config.endpoint().to_string()).or_default();
        target.extend(restored);
        Ok(ToolOutcome::success())
    }
}

pub struct FakeLauncher {
    cluster: FakeCluster,
}

impl FakeLauncher {
    pub fn new(cluster: &FakeCluster) -> Self {
        FakeLauncher {
            cluster: cluster.clone(),
        }
    }
}

pub struct FakeProcess {
    cluster: FakeCluster,
    endpoint: String,
}

impl ServerLauncher for FakeLauncher {
    type Process = FakeProcess;

    async fn launch(&self, spec: &LaunchSpec) -> Result<FakeProcess> {
        let mut state = self.cluster.state.borrow_mut();
        if state.failing_launches > 0 {
            state.failing_launches -= 1;
            anyhow::bail!("server binary refused to start");
        }
        if state.failing_identities.contains(&spec.identity) {
            anyhow::bail!("server binary refused to start for {}", spec.identity);
        }
        state.launches.push(spec.identity.clone());
        state.alive.insert(spec.endpoint.clone(), true);
        state.data.insert(spec.endpoint.clone(), Dataset::new());
        Ok(FakeProcess {
            cluster: self.cluster.clone(),
            endpoint: spec.endpoint.clone(),
        })
    }
}

impl ServerProcess for FakeProcess {
    fn is_running(&mut self) -> bool {
        self.cluster.is_alive(&self.endpoint)
    }

    async fn connect(&mut self) -> Result<()> {
        if self.cluster.state.borrow().unreachable || !self.cluster.is_alive(&self.endpoint) {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn shutdown(&mut self, _timeout: Duration) -> Result<()> {
        let mut state = self.cluster.state.borrow_mut();
        if state.fail_shutdown {
            anyhow::bail!("shutdown request timed out");
        }
        state.alive.insert(self.endpoint.clone(), false);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        let mut state = self.cluster.state.borrow_mut();
        state.kills += 1;
        state.alive.insert(self.endpoint.clone(), false);
        Ok(())
    }
}

pub struct FakeTools {
    cluster: FakeCluster,
}

impl FakeTools {
    pub fn new(cluster: &FakeCluster) -> Self {
        FakeTools {
            cluster: cluster.clone(),
        }
    }
}

impl ClientTools for FakeTools {
    async fn run(&self, config: &OperationConfig) -> Result<ToolOutcome> {
        self.cluster.state.borrow_mut().calls.push(ToolCall {
            kind: config.kind(),
            endpoint: config.endpoint().to_string(),
            selection: config.selection().clone(),
            collection: config.collection().map(str::to_string),
            continuation: config.continuation_enabled(),
            fault_injection: config.fault_injection(),
        });
        if !self.cluster.is_alive(config.endpoint()) {
            return Ok(ToolOutcome::failure(Some(1), "could not connect to server"));
        }
        match config.kind() {
            ToolKind::Dump => self.cluster.dump(config),
            ToolKind::Restore => self.cluster.restore(config),
        }
    }

    async fn backup(&self, request: &BackupRequest) -> Result<BackupOutcome> {
        let mut state = self.cluster.state.borrow_mut();
        match request.action {
            BackupAction::Create => {
                let label = request.label.clone().unwrap_or_default();
                let name = format!("2024-01-01T00.00.{:02}Z_{}", state.snapshots.len(), label);
                let fingerprints = state.backup_key.as_deref().map(key_fingerprint).into_iter().collect();
                let data = state.data.get(&request.endpoint).cloned().unwrap_or_default();
                state.snapshots.push(Snapshot {
                    name: name.clone(),
                    fingerprints,
                    data,
                });
                Ok(BackupOutcome {
                    status: true,
                    identifier: Some(name),
                    message: String::new(),
                })
            }
            BackupAction::Restore => {
                let identifier = request.identifier.clone().unwrap_or_default();
                let Some(snapshot) = state.snapshots.iter().find(|s| s.name == identifier).cloned() else {
                    return Ok(BackupOutcome {
                        status: false,
                        identifier: None,
                        message: format!("backup {} not found", identifier),
                    });
                };
                state.backup_restores += 1;
                state.data.insert(request.endpoint.clone(), snapshot.data);
                Ok(BackupOutcome {
                    status: true,
                    identifier: Some(identifier),
                    message: String::new(),
                })
            }
        }
    }

    async fn list_backups(&self, _endpoint: &str, _auth: Option<&Credentials>) -> Result<serde_json::Value> {
        let state = self.cluster.state.borrow();
        let mut listing = serde_json::Map::new();
        for snapshot in &state.snapshots {
            let keys: Vec<_> = snapshot.fingerprints.iter().map(|fp| json!({ "sha256": fp })).collect();
            listing.insert(snapshot.name.clone(), json!({ "id": snapshot.name, "keys": keys }));
        }
        Ok(serde_json::Value::Object(listing))
    }
}

/// Validation scripts, identified by file stem:
/// `seed` creates `SEED_COUNT` documents per database, `clean` drops
/// everything, `mutate` adds `MUTATION` documents, `validate` and
/// `recheck_after` expect the seeded count, `recheck_before` expects the
/// mutated count. Anything else passes.
pub struct FakePhases {
    cluster: FakeCluster,
}

impl FakePhases {
    pub fn new(cluster: &FakeCluster) -> Self {
        FakePhases {
            cluster: cluster.clone(),
        }
    }
}

fn databases_of(context: &PhaseContext) -> Vec<String> {
    match context.arg("databases") {
        Some(list) => list.split(',').map(str::to_string).collect(),
        None => vec![context.database.clone()],
    }
}

impl PhaseExecutor for FakePhases {
    async fn execute(&self, script: &Path, endpoint: &str, context: &PhaseContext) -> Result<PhaseVerdict> {
        let phase = script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut state = self.cluster.state.borrow_mut();
        state.phases_run.push(phase.clone());
        if state.unreachable_after.contains(&phase) {
            state.unreachable = true;
        }

        if state.crashing_phases.contains(&phase) {
            for alive in state.alive.values_mut() {
                *alive = false;
            }
            return Ok(PhaseVerdict { status: true, message: None });
        }
        if state.failing_phases.contains(&phase) {
            return Ok(PhaseVerdict {
                status: false,
                message: Some(format!("{} assertions failed", phase)),
            });
        }

        let databases = databases_of(context);
        let data = state.data.entry(endpoint.to_string()).or_default();
        let expect = |data: &Dataset, expected: u64| -> PhaseVerdict {
            match databases.iter().find(|db| data.get(*db).copied().unwrap_or(0) != expected) {
                Some(db) => PhaseVerdict {
                    status: false,
                    message: Some(format!(
                        "{}: expected {} documents, found {}",
                        db,
                        expected,
                        data.get(db).copied().unwrap_or(0)
                    )),
                },
                None => PhaseVerdict { status: true, message: None },
            }
        };
        let verdict = match phase.as_str() {
            "seed" => {
                for db in &databases {
                    data.insert(db.clone(), SEED_COUNT);
                }
                PhaseVerdict { status: true, message: None }
            }
            "clean" => {
                data.clear();
                PhaseVerdict { status: true, message: None }
            }
            "mutate" => {
                for db in &databases {
                    *data.entry(db.clone()).or_default() += MUTATION;
                }
                PhaseVerdict { status: true, message: None }
            }
            "validate" | "recheck_after" => expect(&*data, SEED_COUNT),
            "recheck_before" => expect(&*data, SEED_COUNT + MUTATION),
            _ => PhaseVerdict { status: true, message: None },
        };
        Ok(verdict)
    }
}
