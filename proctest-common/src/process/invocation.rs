//! Invocation descriptions and their results.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::error::{CommandError, Expectation, HarnessError, HarnessResult};

/// Default wall-clock budget for a single invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to run one subprocess. Immutable once built.
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    program: PathBuf,
    args: Vec<String>,
    input: Option<Vec<u8>>,
    env: Option<BTreeMap<String, String>>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
    merge_streams: bool,
}

impl ProcessInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: None,
            env: None,
            current_dir: None,
            timeout: DEFAULT_TIMEOUT,
            merge_streams: false,
        }
    }

    /// Build an invocation from a full argv (`argv[0]` is the program).
    pub fn from_argv<I, S>(argv: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .ok_or_else(|| HarnessError::Conflict("cannot run an empty command line".into()))?;
        Ok(Self::new(program).args(argv))
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

    /// Bytes written to the child's stdin before it is closed.
    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Replace the child's entire environment with `env`.
    pub fn env_map(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send stderr into the same pipe as stdout.
    pub fn merge_streams(mut self, merge: bool) -> Self {
        self.merge_streams = merge;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn input_bytes(&self) -> Option<&[u8]> {
        self.input.as_deref()
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn merges_streams(&self) -> bool {
        self.merge_streams
    }

    /// Program followed by arguments, for diagnostics.
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// A `Command` with program, args, environment and working directory
    /// applied. Standard streams are left to the caller.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(env) = &self.env {
            cmd.env_clear().envs(env);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(if self.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd
    }
}

/// Outcome of one [`ProcessInvocation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    pub command: Vec<String>,
    /// Negative values encode death by signal `-exit_code`.
    pub exit_code: i32,
    pub stdout: String,
    /// `None` when stderr was merged into stdout.
    pub stderr: Option<String>,
    /// The process outlived its timeout and had to be signalled.
    pub timed_out: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ProcessResult {
    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Signal number that killed the process, if any.
    pub fn signal(&self) -> Option<i32> {
        (self.exit_code < 0).then_some(-self.exit_code)
    }

    pub fn stdout_contains(&self, pattern: &str) -> bool {
        self.stdout.contains(pattern)
    }

    pub fn stderr_contains(&self, pattern: &str) -> bool {
        self.stderr.as_deref().is_some_and(|s| s.contains(pattern))
    }

    /// Stdout followed by stderr (if captured separately).
    pub fn combined_output(&self) -> String {
        match &self.stderr {
            Some(stderr) => format!("{}\n{}", self.stdout, stderr),
            None => self.stdout.clone(),
        }
    }

    /// Turn a result into an expectation mismatch unless `expected` holds.
    pub fn expect(self, expected: Expectation) -> HarnessResult<Self> {
        if expected.matches(self.exit_code) {
            return Ok(self);
        }
        Err(CommandError {
            command: self.command,
            expected,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
        .into())
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// The current process environment as UTF-8 pairs. Variables whose name or
/// value is not valid UTF-8 are left out.
pub fn inherited_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| {
            let name = key.to_string_lossy().into_owned();
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some((key, value)),
                _ => {
                    warn!(variable = %name, "skipping environment variable that is not valid UTF-8");
                    None
                }
            }
        })
        .collect()
}

/// Split a shell-style command line into arguments.
pub fn split_args(line: &str) -> HarnessResult<Vec<String>> {
    shell_words::split(line)
        .map_err(|e| HarnessError::Conflict(format!("cannot split arguments {line:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32) -> ProcessResult {
        ProcessResult {
            command: vec!["prog".into(), "arg".into()],
            exit_code,
            stdout: "hello world\n".into(),
            stderr: Some(String::new()),
            timed_out: false,
            duration: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_command_line() {
        let inv = ProcessInvocation::new("/bin/echo").args(["a", "b"]).arg("c");
        assert_eq!(inv.command_line(), vec!["/bin/echo", "a", "b", "c"]);
        assert_eq!(inv.get_timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_from_argv() {
        let inv = ProcessInvocation::from_argv(["sh", "-c", "true"]).unwrap();
        assert_eq!(inv.program(), Path::new("sh"));
        assert_eq!(inv.arguments(), ["-c", "true"]);
        assert!(ProcessInvocation::from_argv(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_result_helpers() {
        let ok = result(0);
        assert!(ok.success());
        assert!(ok.stdout_contains("hello"));
        assert!(!ok.stderr_contains("hello"));
        assert_eq!(ok.signal(), None);
        assert_eq!(result(-9).signal(), Some(9));
    }

    #[test]
    fn test_expect() {
        assert!(result(0).expect(Expectation::Success).is_ok());
        let err = result(0).expect(Expectation::Failure).unwrap_err();
        let cmd = err.as_command_error().unwrap();
        assert_eq!(cmd.command, vec!["prog", "arg"]);
        assert_eq!(cmd.exit_code, 0);
        assert!(result(4).expect(Expectation::Failure).is_ok());
    }

    #[test]
    fn test_split_args() {
        assert_eq!(
            split_args("add 'buy milk' +home").unwrap(),
            vec!["add", "buy milk", "+home"]
        );
        assert!(split_args("add 'unterminated").is_err());
    }
}
