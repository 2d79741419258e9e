// Error taxonomy for the grading engine
use gradebox_common::types::ErrorKind;
use std::fmt;

/// Which limit a sandboxed program ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    CpuTime,
    Output,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => f.write_str("Memory"),
            ResourceKind::CpuTime => f.write_str("CPU time"),
            ResourceKind::Output => f.write_str("Output"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Time limit exceeded after {limit_ms} ms")]
    Timeout { limit_ms: u64 },

    #[error("{kind} limit exceeded: {detail}")]
    Resource { kind: ResourceKind, detail: String },

    /// The backend itself failed (daemon unreachable, spawn failure, IO).
    #[error("Sandbox failure: {0:#}")]
    Unavailable(#[from] anyhow::Error),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
            SandboxError::Resource { .. } => ErrorKind::Resource,
            SandboxError::Unavailable(_) => ErrorKind::Runtime,
        }
    }
}

/// Submission-fatal failure to turn source text into a runnable artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{diagnostic}")]
pub struct CompileError {
    pub diagnostic: String,
}

impl CompileError {
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }
}

/// Failures that prevent a report from being produced at all.
#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("Grading cancelled after {completed} of {total} cases")]
    Cancelled { completed: usize, total: usize },

    #[error("Invalid entry point {entry}: {reason}")]
    InvalidEntryPoint { entry: String, reason: String },

    #[error("Report invariant violated: {0}")]
    Invariant(String),
}
