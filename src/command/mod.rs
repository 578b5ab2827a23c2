//! Privileged command execution shared by the `ip` and `podman` adapters
//!
//! Every OS or runtime operation is a one-shot child process. Failures are
//! classified so callers can treat "the resource is already gone" as
//! success during teardown and recovery.

use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::CommandError;

/// stderr fragments that mean the target resource is absent
static NOT_FOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(no such (container|network|object|device|process)|cannot find device|does not exist|not found)",
    )
    .expect("not-found pattern is valid")
});

/// A fully-specified command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Human-readable rendering used in logs and errors
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Build the tokio command without running it
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Run to completion and return stdout.
    ///
    /// `subject` names the resource the command acts on; it becomes the
    /// payload of `CommandError::NotFound` when the tool reports absence.
    pub async fn output(&self, subject: &str) -> Result<String, CommandError> {
        debug!(command = %self.display(), "Running command");

        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                command: self.display(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            trace!(command = %self.display(), stdout = %stdout.trim(), "Command succeeded");
            return Ok(stdout);
        }

        Err(classify(
            &self.display(),
            output.status.code().unwrap_or(-1),
            &stderr,
            subject,
        ))
    }

    /// Run for its exit status only; a non-zero exit is `Ok(false)`
    pub async fn succeeds(&self) -> Result<bool, CommandError> {
        let status = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| CommandError::Spawn {
                command: self.display(),
                source,
            })?;

        Ok(status.success())
    }
}

/// Map a failed command onto `NotFound` or `Failed`
pub fn classify(command: &str, status: i32, stderr: &str, subject: &str) -> CommandError {
    if NOT_FOUND.is_match(stderr) {
        CommandError::NotFound(subject.to_string())
    } else {
        CommandError::Failed {
            command: command.to_string(),
            status,
            stderr: stderr.to_string(),
        }
    }
}

/// Locate a binary on PATH, falling back to a well-known location
pub fn locate(binary: &str, fallback: &str) -> String {
    which::which(binary)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| fallback.to_string())
}
