//! Isolated client sessions for the program under test.
//!
//! Every session owns a fresh data directory and configuration file. The
//! data-directory and config-file variables of the inherited environment
//! are always overridden, so ambient user state never leaks into a test.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{Expectation, HarnessError, HarnessResult};
use crate::hooks::Hooks;
use crate::process::{ProcessInvocation, ProcessResult, Supervisor, inherited_env, split_args};
use crate::server::{ServerInstance, UserCredentials, remove_dir_tolerant};

/// Variable pointing the client at its data directory.
pub const CLIENT_DATA_VAR: &str = "TASKDATA";
/// Variable pointing the client at its configuration file.
pub const CLIENT_RC_VAR: &str = "TASKRC";

const DIAG_BANNER: &str = "\n##### Debugging information (diag): #####\n";

/// Per-call options for [`ClientSession::invoke`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: Option<String>,
    pub merge_streams: bool,
    /// Falls back to the session's default timeout.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn merge_streams(mut self) -> Self {
        self.merge_streams = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Clock setting for the `faketime` shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeTime {
    /// Start the clock at a fixed point in time.
    Absolute(NaiveDateTime),
    /// Shift the clock, in faketime's own syntax (`+2d`, `-1h`, ...).
    Offset(String),
}

impl FakeTime {
    /// Argument for `faketime -f`.
    pub fn spec(&self) -> String {
        match self {
            Self::Absolute(at) => at.format("@%Y-%m-%d %H:%M:%S").to_string(),
            Self::Offset(offset) => offset.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Live,
    Destroyed,
}

/// An isolated environment for invoking the client binary.
#[derive(Debug)]
pub struct ClientSession {
    binary: PathBuf,
    /// Leading words of every invocation (shim first, binary last).
    command: Vec<String>,
    supervisor: Supervisor,
    data_dir: PathBuf,
    rc_file: PathBuf,
    env: BTreeMap<String, String>,
    timeout: Duration,
    hook_preset_dir: PathBuf,
    hooks: Option<Hooks>,
    credentials: Option<UserCredentials>,
    owned_server: Option<ServerInstance>,
    lifecycle: Lifecycle,
}

impl ClientSession {
    pub fn new(config: &HarnessConfig) -> HarnessResult<Self> {
        let data_dir = tempfile::Builder::new().prefix("task_").tempdir()?.keep();
        let rc_file = data_dir.join("test.rc");

        let mut env = inherited_env();
        env.insert(CLIENT_DATA_VAR.to_string(), data_dir.display().to_string());
        env.insert(CLIENT_RC_VAR.to_string(), rc_file.display().to_string());

        let binary = config.client_binary();
        let session = Self {
            command: vec![binary.display().to_string()],
            binary,
            supervisor: Supervisor::new(config.supervisor.clone()),
            env,
            timeout: config.default_timeout,
            hook_preset_dir: config.hook_preset_dir.clone(),
            hooks: None,
            credentials: None,
            owned_server: None,
            lifecycle: Lifecycle::Live,
            rc_file,
            data_dir,
        };

        std::fs::write(
            &session.rc_file,
            format!(
                "data.location={}\nhooks=off\nnews.version=2.6.0\n",
                session.data_dir.display()
            ),
        )?;
        info!(data_dir = %session.data_dir.display(), "client session created");
        Ok(session)
    }

    fn ensure_live(&self) -> HarnessResult<()> {
        match self.lifecycle {
            Lifecycle::Live => Ok(()),
            Lifecycle::Destroyed => Err(HarnessError::Destroyed {
                what: "Client session",
            }),
        }
    }

    fn invocation<I, S>(&self, args: I, options: &RunOptions) -> ProcessInvocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (program, prefix) = self
            .command
            .split_first()
            .map(|(program, prefix)| (PathBuf::from(program), prefix))
            .unwrap_or_else(|| (self.binary.clone(), &[][..]));
        let mut invocation = ProcessInvocation::new(program)
            .args(prefix.iter().cloned())
            .args(args)
            .env_map(self.env.clone())
            .timeout(options.timeout.unwrap_or(self.timeout))
            .merge_streams(options.merge_streams);
        if let Some(input) = &options.input {
            invocation = invocation.input(input.clone());
        }
        invocation
    }

    /// Run the client with `args`, whatever its exit code.
    pub fn invoke<I, S>(&self, args: I, options: &RunOptions) -> HarnessResult<ProcessResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_live()?;
        self.supervisor.run(&self.invocation(args, options))
    }

    pub fn expect_success<I, S>(&self, args: I, options: &RunOptions) -> HarnessResult<ProcessResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invoke(args, options)?.expect(Expectation::Success)
    }

    pub fn expect_failure<I, S>(&self, args: I, options: &RunOptions) -> HarnessResult<ProcessResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invoke(args, options)?.expect(Expectation::Failure)
    }

    /// Split `line` with shell rules and run it, expecting success.
    pub fn call(&self, line: &str) -> HarnessResult<ProcessResult> {
        self.expect_success(split_args(line)?, &RunOptions::default())
    }

    /// Set a configuration variable through the client's own `config`
    /// command, confirming its prompt.
    pub fn config(&self, var: &str, value: &str) -> HarnessResult<ProcessResult> {
        self.run_config(&["config", "--", var, value])
    }

    pub fn del_config(&self, var: &str) -> HarnessResult<ProcessResult> {
        self.run_config(&["config", var])
    }

    // Bypasses the shim prefix so configuration never depends on faked time.
    fn run_config(&self, args: &[&str]) -> HarnessResult<ProcessResult> {
        self.ensure_live()?;
        let invocation = ProcessInvocation::new(&self.binary)
            .args(args.iter().copied())
            .input("y\n")
            .env_map(self.env.clone())
            .timeout(self.timeout);
        self.supervisor.run_expecting_success(&invocation)
    }

    /// Lines of the session's configuration file.
    pub fn rc_content(&self) -> HarnessResult<Vec<String>> {
        self.ensure_live()?;
        Ok(std::fs::read_to_string(&self.rc_file)?
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Run the client's `diag` command. With `merge_with`, its output is
    /// appended to that earlier result's streams under a banner.
    pub fn diag(&self, merge_with: Option<&ProcessResult>) -> HarnessResult<ProcessResult> {
        let diag = match self.expect_success(["diag"], &RunOptions::default()) {
            Ok(result) => result,
            Err(HarnessError::ExpectationMismatch(err)) => ProcessResult {
                command: err.command.clone(),
                exit_code: err.exit_code,
                stdout: String::new(),
                stderr: Some(err.to_string()),
                timed_out: false,
                duration: Duration::ZERO,
            },
            Err(e) => return Err(e),
        };

        let Some(previous) = merge_with else {
            return Ok(diag);
        };
        let stdout = if diag.stdout.is_empty() {
            "Not available, check STDERR"
        } else {
            &diag.stdout
        };
        let stderr = diag
            .stderr
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("Not available, check STDOUT");

        Ok(ProcessResult {
            stdout: format!("{}{DIAG_BANNER}{stdout}", previous.stdout),
            stderr: Some(format!(
                "{}{DIAG_BANNER}{stderr}",
                previous.stderr.as_deref().unwrap_or_default()
            )),
            ..previous.clone()
        })
    }

    /// Prefix every later invocation with the `faketime` shim, or remove
    /// the shim with `None`. Enabling skips the test when faketime is not
    /// installed.
    pub fn faketime(&mut self, time: Option<FakeTime>) -> HarnessResult<()> {
        self.ensure_live()?;
        let shim = match time {
            Some(_) => Some(
                which::which("faketime")
                    .map_err(|_| {
                        HarnessError::Skipped("libfaketime/faketime is not installed".into())
                    })?
                    .display()
                    .to_string(),
            ),
            None => None,
        };

        // The client binary is always the last word of the prefix.
        let shim_len = self.command.len().saturating_sub(1);
        self.command.drain(..shim_len);
        if let (Some(time), Some(shim)) = (time, shim) {
            let spec = time.spec();
            debug!(%spec, "faketime enabled");
            let mut command = vec![shim, "-f".to_string(), spec];
            command.append(&mut self.command);
            self.command = command;
        }
        Ok(())
    }

    /// Leading words of each invocation, shim included.
    pub fn command_prefix(&self) -> &[String] {
        &self.command
    }

    /// Turn hooks on in the configuration and prepare the hook directory.
    pub fn activate_hooks(&mut self) -> HarnessResult<&mut Hooks> {
        self.config("hooks", "1")?;
        let hooks = Hooks::new(&self.data_dir, self.hook_preset_dir.clone())?;
        Ok(self.hooks.insert(hooks))
    }

    pub fn hooks(&self) -> Option<&Hooks> {
        self.hooks.as_ref()
    }

    pub fn hooks_mut(&mut self) -> HarnessResult<&mut Hooks> {
        self.hooks
            .as_mut()
            .ok_or_else(|| HarnessError::Hook("hooks have not been activated".into()))
    }

    /// Point the session at `server` and authenticate as the server's
    /// default user, creating one if the server has none.
    pub fn bind_server(&mut self, server: &mut ServerInstance) -> HarnessResult<UserCredentials> {
        self.ensure_live()?;
        let credentials = match server.default_user() {
            Some(user) => user.clone(),
            None => server.create_user(None, None)?,
        };
        self.bind_as(server, credentials)
    }

    /// Point the session at `server` with explicit credentials.
    pub fn bind_as(
        &mut self,
        server: &ServerInstance,
        credentials: UserCredentials,
    ) -> HarnessResult<UserCredentials> {
        self.ensure_live()?;
        let certs = server.certs();
        let settings = [
            ("taskd.server", server.reservation().to_string()),
            ("taskd.credentials", credentials.as_config_value()),
            ("taskd.certificate", certs.client_cert.display().to_string()),
            ("taskd.key", certs.client_key.display().to_string()),
            ("taskd.ca", certs.ca_cert.display().to_string()),
        ];
        for (var, value) in &settings {
            self.config(var, value)?;
        }
        info!(server = %server.reservation(), user = %credentials.user, "session bound to server");
        self.credentials = Some(credentials.clone());
        Ok(credentials)
    }

    /// Bind to `server` and take ownership of it; destroying the session
    /// destroys the server too.
    pub fn adopt_server(&mut self, mut server: ServerInstance) -> HarnessResult<UserCredentials> {
        let credentials = self.bind_server(&mut server)?;
        self.owned_server = Some(server);
        Ok(credentials)
    }

    pub fn server(&self) -> Option<&ServerInstance> {
        self.owned_server.as_ref()
    }

    pub fn server_mut(&mut self) -> Option<&mut ServerInstance> {
        self.owned_server.as_mut()
    }

    pub fn credentials(&self) -> Option<&UserCredentials> {
        self.credentials.as_ref()
    }

    /// Remove the data directory and refuse further use. Calling it again
    /// is a no-op.
    pub fn destroy(&mut self) -> HarnessResult<()> {
        if self.lifecycle == Lifecycle::Destroyed {
            return Ok(());
        }
        self.hooks = None;
        remove_dir_tolerant(&self.data_dir)?;
        if let Some(mut server) = self.owned_server.take() {
            server.destroy()?;
        }
        self.lifecycle = Lifecycle::Destroyed;
        info!(data_dir = %self.data_dir.display(), "client session destroyed");
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle == Lifecycle::Destroyed
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn rc_file(&self) -> &Path {
        &self.rc_file
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("failed to destroy client session: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// A session whose "client" is `/bin/sh`, so arguments are scripts.
    fn sh_session() -> ClientSession {
        ClientSession::new(&HarnessConfig::default().with_client_binary("/bin/sh")).unwrap()
    }

    #[test]
    fn test_environment_points_at_private_paths() {
        let session = sh_session();
        let result = session
            .expect_success(["-c", "echo $TASKDATA; echo $TASKRC"], &RunOptions::default())
            .unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(Path::new(lines[0]), session.data_dir());
        assert_eq!(Path::new(lines[1]), session.rc_file());
        assert!(session.rc_content().unwrap().contains(&"hooks=off".to_string()));
    }

    #[test]
    fn test_sessions_never_share_directories() {
        let a = sh_session();
        let b = sh_session();
        assert_ne!(a.data_dir(), b.data_dir());
    }

    #[test]
    fn test_expectations() {
        let session = sh_session();
        let ok = session.call("-c 'echo hello'").unwrap();
        assert!(ok.stdout_contains("hello"));

        let err = session
            .expect_failure(["-c", "echo hello"], &RunOptions::default())
            .unwrap_err();
        let cmd = err.as_command_error().unwrap();
        assert_eq!(cmd.exit_code, 0);
        assert_eq!(cmd.command[1..], ["-c", "echo hello"]);

        let failed = session
            .expect_failure(["-c", "exit 3"], &RunOptions::default())
            .unwrap();
        assert_eq!(failed.exit_code, 3);
    }

    #[test]
    fn test_input_and_merge() {
        let session = sh_session();
        let result = session
            .expect_success(
                ["-c", "cat; echo oops >&2"],
                &RunOptions::default().input("piped\n").merge_streams(),
            )
            .unwrap();
        assert_eq!(result.stdout, "piped\noops\n");
        assert_eq!(result.stderr, None);
    }

    #[test]
    fn test_destroy_is_terminal_and_idempotent() {
        let mut session = sh_session();
        let dir = session.data_dir().to_path_buf();
        session.destroy().unwrap();
        assert!(!dir.exists());
        session.destroy().unwrap();
        assert!(matches!(
            session.call("-c true"),
            Err(HarnessError::Destroyed { .. })
        ));
    }

    #[test]
    fn test_destroy_tolerates_removed_directory() {
        let mut session = sh_session();
        std::fs::remove_dir_all(session.data_dir()).unwrap();
        session.destroy().unwrap();
    }

    #[test]
    fn test_diag_merges_into_previous_result() {
        let session = sh_session();
        let previous = ProcessResult {
            command: vec!["x".into()],
            exit_code: 1,
            stdout: "first".into(),
            stderr: Some("boom".into()),
            timed_out: false,
            duration: Duration::ZERO,
        };
        // `sh diag` fails: there is no script called diag.
        let merged = session.diag(Some(&previous)).unwrap();
        assert_eq!(merged.exit_code, 1);
        assert!(merged.stdout.starts_with("first\n##### Debugging information"));
        assert!(merged.stdout.ends_with("Not available, check STDERR"));
        assert!(merged.stderr.unwrap().starts_with("boom\n#####"));
    }

    #[test]
    fn test_fake_time_spec() {
        let at = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        assert_eq!(FakeTime::Absolute(at).spec(), "@2024-02-29 12:30:00");
        assert_eq!(FakeTime::Offset("+3d".into()).spec(), "+3d");
    }

    #[test]
    fn test_faketime_toggles_prefix() {
        let mut session = sh_session();
        match session.faketime(Some(FakeTime::Offset("+1d".into()))) {
            Err(HarnessError::Skipped(_)) => return,
            other => other.unwrap(),
        }
        assert_eq!(session.command_prefix().len(), 4);
        session.faketime(Some(FakeTime::Offset("-1d".into()))).unwrap();
        assert_eq!(session.command_prefix()[2], "-1d");
        session.faketime(None).unwrap();
        assert_eq!(session.command_prefix(), [session.binary().display().to_string()]);
    }

    #[test]
    fn test_removing_faketime_never_needs_the_shim() {
        let mut session = sh_session();
        session.faketime(None).unwrap();
        assert_eq!(session.command_prefix(), [session.binary().display().to_string()]);
    }

    #[test]
    fn test_session_survives_non_utf8_environment() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        const CHILD_MARKER: &str = "PROCTEST_NON_UTF8_CHILD";
        if std::env::var_os(CHILD_MARKER).is_some() {
            let session = sh_session();
            let result = session.call("-c 'echo $TASKDATA'").unwrap();
            assert_eq!(Path::new(result.stdout.trim_end()), session.data_dir());
            return;
        }

        // Re-run this test in a child whose environment is not valid UTF-8.
        let status = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "client::tests::test_session_survives_non_utf8_environment",
                "--test-threads=1",
            ])
            .env(CHILD_MARKER, "1")
            .env("PROCTEST_BAD_BYTES", OsStr::from_bytes(b"\xff\xfe"))
            .status()
            .unwrap();
        assert!(status.success(), "child exited with {status}");
    }

    #[test]
    fn test_hooks_require_activation() {
        let mut session = sh_session();
        assert!(session.hooks().is_none());
        assert!(matches!(session.hooks_mut(), Err(HarnessError::Hook(_))));
    }
}
