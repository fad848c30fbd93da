//! Background server lifecycle: provision, start, health-check, stop, destroy.
//!
//! An instance owns a private data directory and a port reservation for its
//! whole life. It may be started and stopped any number of times; once
//! destroyed every operation fails with [`HarnessError::Destroyed`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::datafile::{DataLine, parse_datafile};
use crate::error::{HarnessError, HarnessResult, WaitKind};
use crate::ports::{PortAllocator, PortReservation, port_in_use};
use crate::process::{
    ProcessInvocation, ProcessResult, Signal, Supervisor, exit_code_of, inherited_env, send_signal,
};

/// Variable pointing the server at its data directory.
pub const SERVER_DATA_VAR: &str = "TASKDDATA";

/// Literal line prefix the server prints when it creates a user.
pub const USER_KEY_PREFIX: &str = "New user key: ";

const ORG_DEFAULT: &str = "default_org";
const EXIT_POLLS: u32 = 10;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observable server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    NeverStarted,
    Running,
    /// Stopped through [`ServerInstance::stop`]; may be started again.
    Stopped,
    /// Process exited on its own; carries its exit code.
    Exited(i32),
    /// Process alive but not accepting connections.
    NotListening,
}

/// Certificates handed to the server and to bound clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertPaths {
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub server_crl: PathBuf,
    pub ca_cert: PathBuf,
}

impl CertPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            client_cert: dir.join("client.cert.pem"),
            client_key: dir.join("client.key.pem"),
            server_cert: dir.join("server.cert.pem"),
            server_key: dir.join("server.key.pem"),
            server_crl: dir.join("server.crl.pem"),
            ca_cert: dir.join("ca.cert.pem"),
        }
    }
}

/// A user registered on a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserCredentials {
    pub user: String,
    pub org: String,
    pub key: String,
}

impl UserCredentials {
    /// `org/user/key`, the form clients store in their configuration.
    pub fn as_config_value(&self) -> String {
        format!("{}/{}/{}", self.org, self.user, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Live,
    Destroyed,
}

/// A server process bound to a reserved port.
#[derive(Debug)]
pub struct ServerInstance {
    binary: PathBuf,
    supervisor: Supervisor,
    allocator: Arc<PortAllocator>,
    reservation: PortReservation,
    data_dir: PathBuf,
    log_file: PathBuf,
    pid_file: PathBuf,
    stdout_file: PathBuf,
    stderr_file: PathBuf,
    certs: CertPaths,
    env: BTreeMap<String, String>,
    start_attempts: u32,
    poll_interval: Duration,
    timeout: Duration,
    child: Option<Child>,
    stopped: bool,
    user_count: usize,
    users: Vec<UserCredentials>,
    default_user: Option<UserCredentials>,
    lifecycle: Lifecycle,
}

impl ServerInstance {
    /// Reserve a port, initialize a fresh data directory and register a
    /// default user. The server is not started.
    pub fn new(config: &HarnessConfig, allocator: Arc<PortAllocator>) -> HarnessResult<Self> {
        let data_dir = tempfile::Builder::new()
            .prefix("taskd_")
            .tempdir()?
            .keep();
        let reservation = match allocator.reserve(&config.server_address, config.server_start_port)
        {
            Ok(reservation) => reservation,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&data_dir);
                return Err(e);
            }
        };

        let mut env = inherited_env();
        env.insert(SERVER_DATA_VAR.to_string(), data_dir.display().to_string());

        let mut instance = Self {
            binary: config.server_binary(),
            supervisor: Supervisor::new(config.supervisor.clone()),
            allocator,
            reservation,
            log_file: data_dir.join("taskd.log"),
            pid_file: data_dir.join("taskd.pid"),
            stdout_file: data_dir.join("server.stdout"),
            stderr_file: data_dir.join("server.stderr"),
            certs: CertPaths::in_dir(&config.cert_dir),
            env,
            start_attempts: config.server_start_attempts,
            poll_interval: config.server_poll_interval,
            timeout: config.default_timeout,
            child: None,
            stopped: false,
            user_count: 0,
            users: Vec::new(),
            default_user: None,
            lifecycle: Lifecycle::Live,
            data_dir,
        };
        info!(
            data_dir = %instance.data_dir.display(),
            port = instance.reservation.port,
            "server instance created"
        );

        // From here on `Drop` cleans up if provisioning fails.
        instance.provision()?;
        Ok(instance)
    }

    fn provision(&mut self) -> HarnessResult<()> {
        self.admin(&["init"])?;

        let server = self.reservation.to_string();
        let log = self.log_file.display().to_string();
        let pid = self.pid_file.display().to_string();
        let root = self.data_dir.display().to_string();
        let certs = self.certs.clone();
        let settings = [
            ("server", server.as_str()),
            ("family", "IPv4"),
            ("log", log.as_str()),
            ("pid.file", pid.as_str()),
            ("root", root.as_str()),
            ("client.allow", "^task [2-9]"),
        ];
        for (var, value) in settings {
            self.config(var, value)?;
        }
        let cert_settings = [
            ("client.cert", &certs.client_cert),
            ("client.key", &certs.client_key),
            ("server.cert", &certs.server_cert),
            ("server.key", &certs.server_key),
            ("server.crl", &certs.server_crl),
            ("ca.cert", &certs.ca_cert),
        ];
        for (var, path) in cert_settings {
            self.config(var, &path.display().to_string())?;
        }

        let user = self.create_user(None, None)?;
        self.default_user = Some(user);
        Ok(())
    }

    fn ensure_live(&self) -> HarnessResult<()> {
        match self.lifecycle {
            Lifecycle::Live => Ok(()),
            Lifecycle::Destroyed => Err(HarnessError::Destroyed {
                what: "Server instance",
            }),
        }
    }

    /// Run an administrative subcommand against this instance's data dir.
    fn admin(&self, args: &[&str]) -> HarnessResult<ProcessResult> {
        self.supervisor.run_expecting_success(&self.admin_invocation(args))
    }

    fn admin_invocation(&self, args: &[&str]) -> ProcessInvocation {
        let (subcommand, rest) = args.split_first().unwrap_or((&"", &[]));
        let mut invocation = ProcessInvocation::new(&self.binary).arg(*subcommand);
        if *subcommand == "config" {
            invocation = invocation.arg("--force");
        }
        invocation
            .args(["--data", &self.data_dir.display().to_string()])
            .args(rest.iter().copied())
            .env_map(self.env.clone())
            .timeout(self.timeout)
    }

    /// Set `var` to `value` in the server configuration. A running server
    /// receives SIGHUP so it reloads.
    pub fn config(&mut self, var: &str, value: &str) -> HarnessResult<()> {
        self.ensure_live()?;
        self.admin(&["config", var, value])?;

        if let Some(child) = &self.child
            && !send_signal(child.id(), Signal::Hup)
        {
            debug!(pid = child.id(), "could not deliver SIGHUP");
        }
        Ok(())
    }

    /// Register a user, creating its organization if needed. Without a
    /// name a unique `test_user_<n>` is generated.
    pub fn create_user(
        &mut self,
        user: Option<&str>,
        org: Option<&str>,
    ) -> HarnessResult<UserCredentials> {
        self.ensure_live()?;
        let user = match user {
            Some(user) => user.to_string(),
            None => {
                let name = format!("test_user_{}", self.user_count);
                self.user_count += 1;
                name
            }
        };
        let org = org.unwrap_or(ORG_DEFAULT).to_string();

        self.add_entity("org", &org, None, true)?;
        let output = self
            .add_entity("user", &org, Some(&user), false)?
            .unwrap_or_default();

        // The key is scraped from the tool's human-readable output.
        let key = extract_user_key(&output).ok_or_else(|| {
            HarnessError::Conflict(format!(
                "no '{USER_KEY_PREFIX}' line in output while creating user {user}: {output:?}"
            ))
        })?;

        let credentials = UserCredentials { user, org, key };
        debug!(user = %credentials.user, org = %credentials.org, "user created");
        self.users.push(credentials.clone());
        Ok(credentials)
    }

    /// Returns the command's stdout, or `None` when an "already exists"
    /// failure was tolerated.
    fn add_entity(
        &self,
        keyword: &str,
        org: &str,
        value: Option<&str>,
        ignore_exists: bool,
    ) -> HarnessResult<Option<String>> {
        let mut args = vec!["add", keyword, org];
        args.extend(value);
        match self.admin(&args) {
            Ok(result) => Ok(Some(result.stdout)),
            Err(HarnessError::ExpectationMismatch(err))
                if ignore_exists
                    && err
                        .stdout
                        .lines()
                        .any(|line| line.trim_end().ends_with("already exists.")) =>
            {
                debug!(keyword, org, "entity already exists");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Current state of the server process.
    pub fn status(&mut self) -> ServerStatus {
        let Some(child) = self.child.as_mut() else {
            return if self.stopped {
                ServerStatus::Stopped
            } else {
                ServerStatus::NeverStarted
            };
        };
        if let Ok(Some(status)) = child.try_wait() {
            return ServerStatus::Exited(exit_code_of(status));
        }
        match port_in_use(&self.reservation.address, self.reservation.port) {
            Ok(true) => ServerStatus::Running,
            _ => ServerStatus::NotListening,
        }
    }

    /// Exit code if the server process has finished.
    pub fn returncode(&mut self) -> Option<i32> {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
            .map(exit_code_of)
    }

    /// Launch the server and wait until it accepts connections.
    pub fn start(&mut self) -> HarnessResult<()> {
        self.ensure_live()?;
        if self.child.is_some() {
            self.show_log_contents();
            return Err(HarnessError::AlreadyRunning);
        }

        let invocation = ProcessInvocation::new(&self.binary)
            .args(["server", "--data", &self.data_dir.display().to_string()])
            .env_map(self.env.clone());
        let child = match self
            .supervisor
            .launch(&invocation, &self.stdout_file, &self.stderr_file)
        {
            Ok(child) => child,
            Err(e) => {
                let log = self.show_log_contents();
                return Err(HarnessError::ServerStartup {
                    reason: format!("server was never started: {e}"),
                    log,
                });
            }
        };
        info!(pid = child.id(), port = self.reservation.port, "server launched");
        self.child = Some(child);

        for _ in 0..self.start_attempts {
            match self.status() {
                ServerStatus::Running => {
                    info!(port = self.reservation.port, "server listening");
                    return Ok(());
                }
                ServerStatus::NeverStarted | ServerStatus::Stopped => {
                    let log = self.show_log_contents();
                    return Err(HarnessError::ServerStartup {
                        reason: "server was never started".to_string(),
                        log,
                    });
                }
                ServerStatus::Exited(code) => {
                    let (stdout, stderr) = self.buffered_output();
                    // Reap it so a later start() is allowed.
                    if let Some(mut child) = self.child.take() {
                        let _ = child.wait();
                    }
                    let log = self.show_log_contents();
                    return Err(HarnessError::ServerStartup {
                        reason: format!(
                            "server launched with '{}' exited prematurely. Exit code: {code}. \
                             Listening on port: {}. Stdout: {stdout:?}, Stderr: {stderr:?}.",
                            self.binary.display(),
                            self.reservation.port
                        ),
                        log,
                    });
                }
                ServerStatus::NotListening => thread::sleep(self.poll_interval),
            }
        }

        // Stop first so the captured output is complete.
        self.stop()?;
        let (stdout, stderr) = self.buffered_output();
        let log = self.show_log_contents();
        warn!(
            port = self.reservation.port,
            attempts = self.start_attempts,
            %stdout,
            %stderr,
            "server never listened"
        );
        Err(HarnessError::Timeout {
            wait: WaitKind::Listen,
            after: self.poll_interval * self.start_attempts,
            partial_stdout: stdout,
            partial_stderr: format!("{stderr}{log}"),
        })
    }

    /// SIGTERM, then SIGKILL if the server lingers; always reaps.
    pub fn stop(&mut self) -> HarnessResult<()> {
        self.ensure_live()?;
        let mut child = self.child.take().ok_or(HarnessError::NotRunning)?;
        let pid = child.id();

        if !send_signal(pid, Signal::Term) {
            debug!(pid, "could not deliver SIGTERM");
        }
        if !wait_for_exit(&mut child) {
            warn!(pid, "server ignored SIGTERM, killing");
            let _ = child.kill();
        }
        let status = child.wait()?;
        self.stopped = true;
        info!(pid, exit_code = exit_code_of(status), "server stopped");
        Ok(())
    }

    /// Stop if running, remove the data directory and release the port.
    /// Calling it again is a no-op.
    pub fn destroy(&mut self) -> HarnessResult<()> {
        if self.lifecycle == Lifecycle::Destroyed {
            return Ok(());
        }
        if self.child.is_some() {
            self.stop()?;
        }
        remove_dir_tolerant(&self.data_dir)?;
        self.allocator.release(&self.reservation);
        self.lifecycle = Lifecycle::Destroyed;
        info!(port = self.reservation.port, "server instance destroyed");
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle == Lifecycle::Destroyed
    }

    /// Parse the transaction log the server keeps for `credentials`.
    pub fn client_data(&self, credentials: &UserCredentials) -> HarnessResult<Vec<DataLine>> {
        self.ensure_live()?;
        parse_datafile(
            &self
                .data_dir
                .join("orgs")
                .join(&credentials.org)
                .join("users")
                .join(&credentials.key)
                .join("tx.data"),
        )
    }

    /// Log the server's own log file and return its contents.
    pub fn show_log_contents(&self) -> String {
        match std::fs::read_to_string(&self.log_file) {
            Ok(contents) => {
                warn!(
                    log = %self.log_file.display(),
                    "server log:\n#### Start server log ####\n{contents}#### End server log ####"
                );
                contents
            }
            Err(_) => String::new(),
        }
    }

    fn buffered_output(&self) -> (String, String) {
        let read = |path: &Path| std::fs::read_to_string(path).unwrap_or_default();
        (read(&self.stdout_file), read(&self.stderr_file))
    }

    /// True if the configured server binary can be found.
    pub fn is_available(config: &HarnessConfig) -> bool {
        let binary = config.server_binary();
        binary.is_file() || which::which(&binary).is_ok()
    }

    pub fn address(&self) -> &str {
        &self.reservation.address
    }

    pub fn port(&self) -> u16 {
        self.reservation.port
    }

    pub fn reservation(&self) -> &PortReservation {
        &self.reservation
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn certs(&self) -> &CertPaths {
        &self.certs
    }

    pub fn users(&self) -> &[UserCredentials] {
        &self.users
    }

    pub fn default_user(&self) -> Option<&UserCredentials> {
        self.default_user.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("failed to destroy server instance: {e}");
        }
    }
}

/// Poll for up to a second; true once the child has exited.
fn wait_for_exit(child: &mut Child) -> bool {
    for _ in 0..EXIT_POLLS {
        thread::sleep(EXIT_POLL_INTERVAL);
        if matches!(child.try_wait(), Ok(Some(_))) {
            return true;
        }
    }
    false
}

/// First key announced with [`USER_KEY_PREFIX`] in `output`.
pub fn extract_user_key(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix(USER_KEY_PREFIX))
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

/// Remove a directory tree, treating "already gone" as success.
pub(crate) fn remove_dir_tolerant(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
