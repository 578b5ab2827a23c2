//! Error types for the session lifecycle
//!
//! Command-level failures (`CommandError`) are produced by the OS and
//! container adapters. The lifecycle maps them onto `SessionError`, which
//! decides the process exit code. Teardown failures never escalate; they
//! are collected as `TeardownError` and logged.

use thiserror::Error;

use crate::lifecycle::Resource;

/// Failure of a single privileged command (`ip`, `podman`, ...)
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0} does not exist")]
    NotFound(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected output from `{command}`: {reason}")]
    Parse { command: String, reason: String },

    #[error("`{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
}

impl CommandError {
    /// True when the command failed only because its target is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, CommandError::NotFound(_))
    }
}

/// Session-fatal errors, one per row of the error taxonomy
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("address allocation failed: {0}")]
    Allocation(String),

    #[error("another session is already running (lock held on {0})")]
    AlreadyRunning(String),

    #[error("provisioning failed while {step}: {source}")]
    Provisioning {
        step: &'static str,
        #[source]
        source: CommandError,
    },

    #[error("connectivity could not be established after {attempts} attempt(s)")]
    Connectivity { attempts: u32 },

    #[error("proxy exited during the session (status {exit_code:?})")]
    Runtime { exit_code: Option<i32> },
}

impl SessionError {
    pub fn provisioning(step: &'static str, source: CommandError) -> Self {
        SessionError::Provisioning { step, source }
    }

    /// Whether provisioning may have left state behind that needs teardown
    pub fn requires_teardown(&self) -> bool {
        matches!(
            self,
            SessionError::Provisioning { .. }
                | SessionError::Connectivity { .. }
                | SessionError::Runtime { .. }
        )
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Provisioning { .. } => 1,
            SessionError::Config(_) => 2,
            SessionError::Allocation(_) => 3,
            SessionError::Connectivity { .. } => 4,
            SessionError::AlreadyRunning(_) => 5,
            SessionError::Runtime { exit_code } => match exit_code {
                Some(code) if *code != 0 => *code,
                // Killed by a signal
                _ => 1,
            },
        }
    }
}

/// A teardown step that failed; logged, never fatal
#[derive(Debug, Error)]
#[error("failed to remove {resource}: {source}")]
pub struct TeardownError {
    pub resource: Resource,
    #[source]
    pub source: CommandError,
}
