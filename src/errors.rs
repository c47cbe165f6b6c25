// dumpcheck/src/errors.rs
use thiserror::Error;

/// Failure categories of a validation run.
///
/// Plumbing code works with `anyhow::Result`; these variants are wrapped into
/// `anyhow::Error` and recovered with `downcast_ref` when the category matters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    #[error("failed to start server: {0}")]
    Startup(String),

    #[error("operation aborted at injected fault point (exit code {0})")]
    FaultInjectedAbort(i32),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("instance {0} is not alive")]
    Liveness(String),

    #[error("backup {snapshot} does not carry key fingerprint {fingerprint}")]
    IntegrityMismatch { snapshot: String, fingerprint: String },

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("{tool} failed (exit code {exit_code:?}): {stderr}")]
    Tool {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    /// Finds the harness category inside an `anyhow` chain, if any.
    pub fn classify(err: &anyhow::Error) -> Option<&HarnessError> {
        err.chain().find_map(|cause| cause.downcast_ref::<HarnessError>())
    }
}
