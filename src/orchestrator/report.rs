// dumpcheck/src/orchestrator/report.rs
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::phase::PhaseResult;

/// Final outcome of a validation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(serialize_with = "phases_as_map")]
    pub phases: Vec<PhaseResult>,
    pub failed: usize,
    pub first_failure: Option<String>,
    pub retries: BTreeMap<String, u32>,
}

fn phases_as_map<S: Serializer>(phases: &[PhaseResult], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(phases.iter().map(|p| (&p.name, p)))
}

impl RunReport {
    pub fn get(&self, name: &str) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Accumulates step results and enforces the short-circuit: after the first
/// failed step no further pipeline step may run. Teardown is recorded apart.
#[derive(Debug)]
pub struct PipelineRun {
    started_at: DateTime<Utc>,
    phases: Vec<PhaseResult>,
    halted: bool,
    first_failure: Option<String>,
    retries: BTreeMap<String, u32>,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRun {
    pub fn new() -> Self {
        PipelineRun {
            started_at: Utc::now(),
            phases: Vec::new(),
            halted: false,
            first_failure: None,
            retries: BTreeMap::new(),
        }
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Records a pipeline step; returns whether the next step may run.
    pub fn record(&mut self, result: PhaseResult) -> bool {
        debug_assert!(!self.halted, "step {} ran after the pipeline halted", result.name);
        if result.status {
            info!(phase = %result.name, "✓ phase passed");
        } else {
            error!(phase = %result.name, message = ?result.message, "❌ phase failed");
            self.halted = true;
            self.note_failure(&result);
        }
        self.phases.push(result);
        !self.halted
    }

    /// Records teardown. Its failure counts, but never replaces an earlier failure reason.
    pub fn record_teardown(&mut self, result: PhaseResult) {
        if !result.status {
            error!(phase = %result.name, message = ?result.message, "teardown failed");
            self.note_failure(&result);
        }
        self.phases.push(result);
    }

    fn note_failure(&mut self, result: &PhaseResult) {
        if self.first_failure.is_none() {
            self.first_failure = Some(match &result.message {
                Some(msg) => format!("{}: {}", result.name, msg),
                None => result.name.clone(),
            });
        }
    }

    pub fn note_retries(&mut self, step: &str, retries: u32) {
        if retries > 0 {
            *self.retries.entry(step.to_string()).or_default() += retries;
        }
    }

    pub fn finish(self) -> RunReport {
        let failed = self.phases.iter().filter(|p| !p.status).count();
        RunReport {
            started_at: self.started_at,
            finished_at: Utc::now(),
            phases: self.phases,
            failed,
            first_failure: self.first_failure,
            retries: self.retries,
        }
    }
}
