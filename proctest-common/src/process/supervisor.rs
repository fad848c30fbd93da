//! Run a subprocess to completion or forcibly terminate it.
//!
//! Each [`Supervisor::run`] call hands the child to a dedicated I/O worker
//! thread that owns the process handle, feeds stdin and drains stdout/stderr
//! concurrently so a child blocked on a full pipe can never deadlock against
//! a parent blocked on writing input. The calling thread only performs
//! bounded waits on three hand-off channels:
//!
//! 1. the child's pid (`spawn_timeout`),
//! 2. the child's exit status (the invocation's own timeout, then one grace
//!    period per escalation step),
//! 3. the "streams drained" notification (`output_timeout`).

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::invocation::{ProcessInvocation, ProcessResult};
use super::signal::{Signal, exit_code_of, signal_process_group, signal_process_group_or_pid};
use crate::error::{Expectation, HarnessError, HarnessResult, WaitKind};

type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// One rung of the termination ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    pub signal: Signal,
    /// How long to wait for the process to die after sending `signal`.
    pub grace: Duration,
}

/// Timeouts and escalation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub spawn_timeout: Duration,
    pub output_timeout: Duration,
    pub escalation: Vec<EscalationStep>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let grace = Duration::from_secs(1);
        Self {
            spawn_timeout: Duration::from_secs(5),
            output_timeout: Duration::from_secs(1),
            escalation: [Signal::Abrt, Signal::Term, Signal::Kill]
                .into_iter()
                .map(|signal| EscalationStep { signal, grace })
                .collect(),
        }
    }
}

impl SupervisorConfig {
    /// Worst-case time spent signalling a process that outlived its timeout.
    pub fn escalation_budget(&self) -> Duration {
        self.escalation.iter().map(|step| step.grace).sum()
    }
}

/// Launches and supervises subprocesses.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run `invocation` to completion and report whatever it did.
    ///
    /// A non-zero exit code is not an error here. A process that outlives
    /// its timeout is signalled with increasing severity; the result then
    /// carries `timed_out = true` and the negative signal exit code.
    pub fn run(&self, invocation: &ProcessInvocation) -> HarnessResult<ProcessResult> {
        let started = Instant::now();
        let (pid_tx, pid_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let worker = IoWorker {
            invocation: invocation.clone(),
            stdout: SharedBuf::default(),
            stderr: SharedBuf::default(),
        };
        let (stdout_buf, stderr_buf) = (worker.stdout.clone(), worker.stderr.clone());
        thread::Builder::new()
            .name("proctest-io".to_string())
            .spawn(move || worker.run(pid_tx, exit_tx, done_tx))?;

        let pid = match pid_rx.recv_timeout(self.config.spawn_timeout) {
            Ok(Ok(pid)) => pid,
            Ok(Err(source)) => {
                return Err(HarnessError::SpawnFailed {
                    program: invocation.program().to_path_buf(),
                    source,
                });
            }
            Err(_) => {
                // Nobody supervises a child that shows up after we gave up.
                thread::spawn(move || {
                    if let Ok(Ok(pid)) = pid_rx.recv() {
                        warn!(pid, "process started after the spawn timeout, killing it");
                        signal_process_group_or_pid(pid, Signal::Kill);
                    }
                });
                return Err(HarnessError::Timeout {
                    wait: WaitKind::Spawn,
                    after: self.config.spawn_timeout,
                    partial_stdout: String::new(),
                    partial_stderr: String::new(),
                });
            }
        };
        debug!(pid, command = ?invocation.command_line(), "process started");

        let mut timed_out = false;
        let status = match exit_rx.recv_timeout(invocation.get_timeout()) {
            Ok(status) => status,
            Err(RecvTimeoutError::Timeout) => {
                timed_out = true;
                warn!(
                    pid,
                    timeout_ms = invocation.get_timeout().as_millis() as u64,
                    "process exceeded its timeout, escalating"
                );
                self.escalate(pid, &exit_rx)?
            }
            Err(RecvTimeoutError::Disconnected) => return Err(HarnessError::WorkerLost(pid)),
        }?;
        if timed_out {
            // Descendants of the signalled process may still hold its pipes.
            signal_process_group(pid, Signal::Kill);
        }

        match done_rx.recv_timeout(self.config.output_timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                return Err(HarnessError::Timeout {
                    wait: WaitKind::Output,
                    after: self.config.output_timeout,
                    partial_stdout: snapshot(&stdout_buf),
                    partial_stderr: snapshot(&stderr_buf),
                });
            }
            Err(RecvTimeoutError::Disconnected) => return Err(HarnessError::WorkerLost(pid)),
        }

        let exit_code = exit_code_of(status);
        let duration = started.elapsed();
        debug!(
            pid,
            exit_code,
            timed_out,
            duration_ms = duration.as_millis() as u64,
            "process finished"
        );

        Ok(ProcessResult {
            command: invocation.command_line(),
            exit_code,
            stdout: snapshot(&stdout_buf),
            stderr: (!invocation.merges_streams()).then(|| snapshot(&stderr_buf)),
            timed_out,
            duration,
        })
    }

    /// Run and fail with an expectation mismatch unless the exit code
    /// matches `expected`.
    pub fn run_expecting(
        &self,
        invocation: &ProcessInvocation,
        expected: Expectation,
    ) -> HarnessResult<ProcessResult> {
        self.run(invocation)?.expect(expected)
    }

    pub fn run_expecting_success(
        &self,
        invocation: &ProcessInvocation,
    ) -> HarnessResult<ProcessResult> {
        self.run_expecting(invocation, Expectation::Success)
    }

    pub fn run_expecting_failure(
        &self,
        invocation: &ProcessInvocation,
    ) -> HarnessResult<ProcessResult> {
        self.run_expecting(invocation, Expectation::Failure)
    }

    /// Start a long-running process without waiting for it.
    ///
    /// Stdin is closed and both output streams go to files so a chatty
    /// process can never block on a full pipe nobody reads.
    pub fn launch(
        &self,
        invocation: &ProcessInvocation,
        stdout: &Path,
        stderr: &Path,
    ) -> HarnessResult<Child> {
        let mut cmd = invocation.to_command();
        cmd.stdin(Stdio::null())
            .stdout(File::create(stdout)?)
            .stderr(File::create(stderr)?);

        let child = cmd.spawn().map_err(|source| HarnessError::SpawnFailed {
            program: invocation.program().to_path_buf(),
            source,
        })?;
        debug!(pid = child.id(), command = ?invocation.command_line(), "process launched");
        Ok(child)
    }

    /// Walk the escalation ladder until the worker reports an exit status.
    fn escalate(
        &self,
        pid: u32,
        exit_rx: &mpsc::Receiver<io::Result<ExitStatus>>,
    ) -> HarnessResult<io::Result<ExitStatus>> {
        let mut sent = Vec::new();
        for step in &self.config.escalation {
            if let Ok(status) = exit_rx.try_recv() {
                return Ok(status);
            }
            // A failed delivery usually means the process just died; the
            // wait below picks that up.
            if !signal_process_group_or_pid(pid, step.signal) {
                debug!(pid, signal = %step.signal, "signal not delivered");
            }
            sent.push(step.signal);

            match exit_rx.recv_timeout(step.grace) {
                Ok(status) => return Ok(status),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(pid, signal = %step.signal, "process survived signal");
                }
                Err(RecvTimeoutError::Disconnected) => return Err(HarnessError::WorkerLost(pid)),
            }
        }

        error!(pid, signals = ?sent, "process could not be killed");
        Err(HarnessError::Unkillable { pid, signals: sent })
    }
}

/// Owns the child for the duration of one `run`.
struct IoWorker {
    invocation: ProcessInvocation,
    stdout: SharedBuf,
    stderr: SharedBuf,
}

impl IoWorker {
    fn run(
        self,
        pid_tx: Sender<io::Result<u32>>,
        exit_tx: Sender<io::Result<ExitStatus>>,
        done_tx: Sender<()>,
    ) {
        let (mut child, merged) = match self.spawn() {
            Ok(spawned) => spawned,
            Err(e) => {
                let _ = pid_tx.send(Err(e));
                return;
            }
        };
        let _ = pid_tx.send(Ok(child.id()));

        let mut pumps = Vec::new();
        if let Some(input) = self.invocation.input_bytes().map(<[u8]>::to_vec)
            && let Some(mut stdin) = child.stdin.take()
        {
            // EPIPE here just means the child stopped reading.
            pumps.push(thread::spawn(move || {
                let _ = stdin.write_all(&input);
            }));
        }
        match merged {
            Some(reader) => pumps.push(pump(reader, self.stdout.clone())),
            None => {
                if let Some(out) = child.stdout.take() {
                    pumps.push(pump(out, self.stdout.clone()));
                }
                if let Some(err) = child.stderr.take() {
                    pumps.push(pump(err, self.stderr.clone()));
                }
            }
        }

        let _ = exit_tx.send(child.wait());

        for handle in pumps {
            let _ = handle.join();
        }
        let _ = done_tx.send(());
    }

    fn spawn(&self) -> io::Result<(Child, Option<io::PipeReader>)> {
        let mut cmd = self.invocation.to_command();
        // Own group, so escalation reaches everything the child forks.
        cmd.process_group(0);
        if self.invocation.merges_streams() {
            let (reader, writer) = io::pipe()?;
            cmd.stdout(writer.try_clone()?).stderr(writer);
            let child = cmd.spawn()?;
            // `cmd` holds the write ends; it must be gone before we read or
            // the reader never sees EOF.
            drop(cmd);
            Ok((child, Some(reader)))
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            Ok((cmd.spawn()?, None))
        }
    }
}

fn pump<R: Read + Send + 'static>(mut reader: R, sink: SharedBuf) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

fn snapshot(buf: &SharedBuf) -> String {
    let bytes = buf.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}
