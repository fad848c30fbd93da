//! Error taxonomy shared by every harness component.
//!
//! Errors fall into three buckets as far as result reporting is concerned:
//! expectation mismatches and assertion failures are ordinary test
//! *failures*, an explicit skip request is a *skip*, and everything else
//! (timeouts, conflicts, exhausted port range, unkillable processes, I/O) is
//! an *error* that aborts the current test.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::Signal;

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Which bounded wait elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Waiting for the I/O worker to report the child's pid.
    Spawn,
    /// Waiting for the I/O worker to hand over captured streams after exit.
    Output,
    /// Waiting for a server to accept connections on its port.
    Listen,
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Spawn => "process start",
            Self::Output => "process output",
            Self::Listen => "server to listen",
        };
        write!(f, "{label}")
    }
}

/// What the caller expected from a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Success,
    Failure,
}

impl Expectation {
    /// True when `exit_code` satisfies this expectation.
    pub fn matches(self, exit_code: i32) -> bool {
        match self {
            Self::Success => exit_code == 0,
            Self::Failure => exit_code != 0,
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "zero"),
            Self::Failure => write!(f, "non-zero"),
        }
    }
}

/// A command finished with an exit code the caller did not expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub command: Vec<String>,
    pub expected: Expectation,
    pub exit_code: i32,
    pub stdout: String,
    /// `None` when stderr was merged into stdout.
    pub stderr: Option<String>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command '{}' was expected to exit with {} status but finished with exit code '{}'",
            self.command.join(" "),
            self.expected,
            self.exit_code
        )?;
        if self.exit_code < 0 {
            write!(f, " (killed by signal {})", -self.exit_code)?;
        }
        write!(f, "\nStdout: '{}'", self.stdout)?;
        match &self.stderr {
            Some(stderr) => write!(f, "\nStderr: '{stderr}'"),
            None => write!(f, "\nStderr: <merged into stdout>"),
        }
    }
}

/// How the result reporter should classify an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Failure,
    Error,
    Skip,
}

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("{0}")]
    ExpectationMismatch(Box<CommandError>),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Timed out after {after:?} waiting for {wait}")]
    Timeout {
        wait: WaitKind,
        after: Duration,
        partial_stdout: String,
        partial_stderr: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{what} has been destroyed. Create a new instance if you need one.")]
    Destroyed { what: &'static str },

    #[error("Server is already running or crashed without being stopped")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("No available port in the range {start}-65535 on {address}")]
    NoPortAvailable { address: String, start: u16 },

    #[error("Process {pid} stopped responding and could not be killed (sent {signals:?})")]
    Unkillable { pid: u32, signals: Vec<Signal> },

    #[error("Failed to start {program}: {source}")]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Server failed to start: {reason}\n{log}")]
    ServerStartup { reason: String, log: String },

    #[error("I/O worker for pid {0} vanished without reporting")]
    WorkerLost(u32),

    #[error("Skipped: {0}")]
    Skipped(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Classify the error for result reporting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ExpectationMismatch(_) | Self::AssertionFailed(_) => ErrorCategory::Failure,
            Self::Skipped(_) => ErrorCategory::Skip,
            _ => ErrorCategory::Error,
        }
    }

    /// Short name of the variant, used as the exception label in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExpectationMismatch(_) => "ExpectationMismatch",
            Self::AssertionFailed(_) => "AssertionFailed",
            Self::Timeout { .. } => "HarnessTimeout",
            Self::Conflict(_) | Self::AlreadyRunning | Self::NotRunning | Self::Hook(_) => {
                "ResourceConflict"
            }
            Self::Destroyed { .. } => "Destroyed",
            Self::NoPortAvailable { .. } => "ExhaustedRange",
            Self::Unkillable { .. } => "FatalSupervisionFailure",
            Self::SpawnFailed { .. } => "SpawnFailed",
            Self::ServerStartup { .. } => "ServerStartup",
            Self::WorkerLost(_) => "WorkerLost",
            Self::Skipped(_) => "Skipped",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
        }
    }

    /// The command error behind an expectation mismatch, if any.
    pub fn as_command_error(&self) -> Option<&CommandError> {
        match self {
            Self::ExpectationMismatch(err) => Some(err),
            _ => None,
        }
    }

    /// Output a process produced before a bounded wait gave up on it, as
    /// `(stdout, stderr)`.
    pub fn partial_output(&self) -> Option<(&str, &str)> {
        match self {
            Self::Timeout {
                partial_stdout,
                partial_stderr,
                ..
            } => Some((partial_stdout, partial_stderr)),
            _ => None,
        }
    }

    /// True for errors that must abort the whole run rather than one test.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unkillable { .. })
    }
}

impl From<CommandError> for HarnessError {
    fn from(err: CommandError) -> Self {
        Self::ExpectationMismatch(Box::new(err))
    }
}

/// Fail with [`HarnessError::AssertionFailed`] unless `condition` holds.
pub fn ensure(condition: bool, message: impl Into<String>) -> HarnessResult<()> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::AssertionFailed(message.into()))
    }
}
