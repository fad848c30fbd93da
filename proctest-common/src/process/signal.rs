//! Signal delivery and exit-status decoding.

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// The termination signals the harness sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Hup,
    Int,
    Abrt,
    Kill,
    Term,
}

impl Signal {
    /// POSIX signal number.
    pub fn number(self) -> i32 {
        match self {
            Self::Hup => 1,
            Self::Int => 2,
            Self::Abrt => 6,
            Self::Kill => 9,
            Self::Term => 15,
        }
    }

    /// Name as accepted by `kill -s`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Hup => "HUP",
            Self::Int => "INT",
            Self::Abrt => "ABRT",
            Self::Kill => "KILL",
            Self::Term => "TERM",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// Send `signal` to `pid`. Returns false if the process no longer exists or
/// the signal could not be delivered.
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    if pid == 0 {
        return false;
    }
    run_kill(&pid.to_string(), pid, signal)
}

/// Send `signal` to every member of process group `pgid`.
pub fn signal_process_group(pgid: u32, signal: Signal) -> bool {
    if pgid == 0 {
        return false;
    }
    run_kill(&format!("-{pgid}"), pgid, signal)
}

/// Send `signal` to the process group led by `pid`, falling back to `pid`
/// alone when no such group exists.
pub fn signal_process_group_or_pid(pid: u32, signal: Signal) -> bool {
    signal_process_group(pid, signal) || send_signal(pid, signal)
}

fn run_kill(target: &str, pid: u32, signal: Signal) -> bool {
    match Command::new("kill")
        .arg("-s")
        .arg(signal.name())
        .arg("--")
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!(pid, %signal, "failed to run kill: {}", e);
            false
        }
    }
}

/// Exit code of a finished process; `-N` when it died to signal `N`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}
