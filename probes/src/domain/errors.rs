//! Structured error types for the ftrace engine
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! ABI parse problems are deliberately NOT here: those are emitted inline in
//! the output stream as data (see `probes_common::ParseStatus`).

use super::types::SessionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("tracefs is in use by another tracer (current_tracer is not nop)")]
    TracingInUse,

    #[error("session {0} is not configured")]
    UnknownSession(SessionId),

    #[error("session {0} was already configured")]
    DuplicateSession(SessionId),

    #[error("session {0} must be configured before activation")]
    NotConfigured(SessionId),

    #[error(
        "exclusive tracefs features (tids_to_trace, tracefs_options, tracing_cpumask) \
         cannot be combined with concurrent sessions"
    )]
    ExclusiveFeatureConflict,

    #[error("invalid tracefs option name: {0}")]
    InvalidTracefsOption(String),

    #[error("tracefs option not found: {0}")]
    UnknownTracefsOption(String),

    #[error("failed to write event tid filter")]
    EventTidFilter,

    #[error("failed to write tracing cpumask {0}")]
    TracingCpuMask(String),

    #[error("failed to update the raw_syscalls kernel filter")]
    SyscallFilter,

    #[error("function_graph setup failed at {file}")]
    FunctionGraph { file: &'static str },

    #[error(
        "cannot enable function_graph: a concurrent session is using a different tracer"
    )]
    TracerConflict,

    #[error("secondary tracefs instances do not support atrace options")]
    AtraceOnSecondaryInstance,

    #[error("concurrent atrace sessions require --only_userspace support")]
    ConcurrentAtraceUnsupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_display() {
        let err = SetupError::UnknownSession(SessionId(9));
        assert_eq!(err.to_string(), "session Session#9 is not configured");
    }

    #[test]
    fn test_exclusive_conflict_display() {
        let err = SetupError::ExclusiveFeatureConflict;
        assert!(err.to_string().contains("exclusive"));
    }
}
