// dumpcheck/src/retry/mod.rs
use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::OperationConfig;
use crate::errors::HarnessError;
use crate::instance::{InstanceHandle, ServerProcess};
use crate::tools::{ClientTools, FAULT_INJECTED_EXIT_CODE, ToolOutcome};

/// Fault-signal retries allowed before fault injection is switched off.
pub const MAX_FAULT_RETRIES: u32 = 21;

/// Bookkeeping for one retryable invocation. Starts fresh on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub fault_injection_active: bool,
}

impl RetryState {
    pub fn new(fault_injection_active: bool) -> Self {
        RetryState {
            attempt: 0,
            max_attempts: MAX_FAULT_RETRIES,
            fault_injection_active,
        }
    }

    /// Counts one fault signal. Once the bound is hit fault injection goes off
    /// for good; returns true on that transition.
    pub fn record_fault(&mut self) -> bool {
        self.attempt += 1;
        if self.fault_injection_active && self.attempt >= self.max_attempts {
            self.fault_injection_active = false;
            return true;
        }
        false
    }
}

#[derive(Debug)]
pub struct RetryReport {
    /// Final tool outcome, or the liveness/terminal-fault error that ended the loop.
    pub outcome: Result<ToolOutcome>,
    /// Fault signals absorbed, also when the loop ended in an error.
    pub retries: u32,
    /// Set when this invocation exhausted the bound and turned fault injection off.
    pub fault_injection_disabled: bool,
}

/// Runs a dump or restore so that the restore tool's deliberate abort at an
/// injected fault point resumes instead of failing the pipeline.
pub struct RetryableOperation<'a, T> {
    tools: &'a T,
    backoff: Duration,
}

impl<'a, T: ClientTools> RetryableOperation<'a, T> {
    /// `backoff` is the flat pause between attempts, already scaled for the build flavour.
    pub fn new(tools: &'a T, backoff: Duration) -> Self {
        RetryableOperation { tools, backoff }
    }

    /// Runs `config` until it ends without the fault signal.
    ///
    /// Every retry resumes with continuation enabled. After `MAX_FAULT_RETRIES`
    /// fault signals the next attempt runs without fault injection, so the loop
    /// always ends. A dead instance ends it immediately with a liveness error,
    /// as does a fault signal while fault injection is already off. A plain
    /// failure is returned as an unsuccessful outcome.
    pub async fn run<P: ServerProcess>(
        &self,
        config: &OperationConfig,
        instance: &mut InstanceHandle<P>,
    ) -> RetryReport {
        let mut state = RetryState::new(config.fault_injection());
        let mut disabled_here = false;
        let outcome = self.run_loop(config, instance, &mut state, &mut disabled_here).await;
        RetryReport {
            outcome,
            retries: state.attempt,
            fault_injection_disabled: disabled_here,
        }
    }

    async fn run_loop<P: ServerProcess>(
        &self,
        config: &OperationConfig,
        instance: &mut InstanceHandle<P>,
        state: &mut RetryState,
        disabled_here: &mut bool,
    ) -> Result<ToolOutcome> {
        let tool = config.kind().name();
        let mut current = config.clone();

        loop {
            let outcome = self
                .tools
                .run(&current)
                .await
                .with_context(|| format!("{} could not be executed", tool))?;

            if !instance.is_alive() {
                return Err(HarnessError::Liveness(instance.identity().to_string()))
                    .with_context(|| format!("server died during {}", tool));
            }
            if !outcome.is_fault_signal() {
                return Ok(outcome);
            }
            if !state.fault_injection_active {
                error!(
                    tool,
                    endpoint = current.endpoint(),
                    selection = ?current.selection(),
                    configured_fault_injection = config.fault_injection(),
                    continuation = current.continuation_enabled(),
                    attempts = state.attempt,
                    "fault signal while fault injection is off"
                );
                return Err(HarnessError::FaultInjectedAbort(FAULT_INJECTED_EXIT_CODE))
                    .with_context(|| format!("{} reported a fault signal with fault injection disabled", tool));
            }

            if state.record_fault() {
                *disabled_here = true;
                warn!(
                    tool,
                    attempts = state.attempt,
                    "fault retry bound reached, continuing without fault injection"
                );
            } else {
                info!(tool, attempt = state.attempt, "operation hit injected fault point, resuming");
            }
            tokio::time::sleep(self.backoff).await;
            current = current
                .with_continuation(true)
                .with_fault_injection(state.fault_injection_active);
        }
    }
}
