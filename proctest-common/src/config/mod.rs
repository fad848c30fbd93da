//! Harness configuration.
//!
//! Defaults point at an in-tree build (`<workspace>/src/<binary>`); every
//! setting can be overridden through `PROCTEST_*` environment variables or
//! the builder-style `with_*` methods.

pub mod env;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};
use crate::ports::DEFAULT_START_PORT;
use crate::process::{DEFAULT_TIMEOUT, EscalationStep, SupervisorConfig};
pub use env::{EnvError, EnvParser};

/// Default program under test.
pub const DEFAULT_CLIENT_BINARY: &str = "task";
/// Default companion server.
pub const DEFAULT_SERVER_BINARY: &str = "taskd";

/// Resolved harness settings.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Fixed build-output directory holding both binaries.
    pub bin_dir: PathBuf,
    pub client_binary_name: String,
    pub server_binary_name: String,
    /// Look the client up on `PATH` instead of `bin_dir`.
    pub client_use_path: bool,
    /// Look the server up on `PATH` instead of `bin_dir`.
    pub server_use_path: bool,
    pub skip_client: bool,
    pub skip_server: bool,
    /// Directory holding the pre-generated TLS certificates.
    pub cert_dir: PathBuf,
    /// Directory holding preset hook scripts.
    pub hook_preset_dir: PathBuf,
    pub default_timeout: Duration,
    pub server_address: String,
    pub server_start_port: u16,
    pub server_start_attempts: u32,
    pub server_poll_interval: Duration,
    pub supervisor: SupervisorConfig,
    client_binary_override: Option<PathBuf>,
    server_binary_override: Option<PathBuf>,
}

fn workspace_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(manifest_dir)
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let root = workspace_root();
        Self {
            bin_dir: root.join("src"),
            client_binary_name: DEFAULT_CLIENT_BINARY.to_string(),
            server_binary_name: DEFAULT_SERVER_BINARY.to_string(),
            client_use_path: false,
            server_use_path: false,
            skip_client: false,
            skip_server: false,
            cert_dir: root.join("test").join("test_certs"),
            hook_preset_dir: root.join("test").join("test_hooks"),
            default_timeout: DEFAULT_TIMEOUT,
            server_address: "localhost".to_string(),
            server_start_port: DEFAULT_START_PORT,
            // Five minutes at two probes per second.
            server_start_attempts: 600,
            server_poll_interval: Duration::from_millis(500),
            supervisor: SupervisorConfig::default(),
            client_binary_override: None,
            server_binary_override: None,
        }
    }
}

impl HarnessConfig {
    /// Read `PROCTEST_*` variables from the process environment.
    ///
    /// Returns every invalid variable at once instead of stopping at the
    /// first one.
    pub fn from_env() -> Result<Self, Vec<EnvError>> {
        let mut parser = EnvParser::new();
        let config = Self::from_parser(&mut parser);
        if parser.has_errors() {
            return Err(parser.take_errors());
        }
        Ok(config)
    }

    /// Build from any parser; errors accumulate in `parser`.
    pub fn from_parser(parser: &mut EnvParser) -> Self {
        let defaults = Self::default();
        let grace = defaults
            .supervisor
            .escalation
            .first()
            .map(|step| step.grace)
            .unwrap_or(Duration::from_secs(1));
        let grace = parser.get_millis("KILL_GRACE_MS", grace, 60_000);

        Self {
            bin_dir: parser.get_opt_path("BIN_DIR").unwrap_or(defaults.bin_dir),
            client_binary_name: parser.get_string("CLIENT_BIN", DEFAULT_CLIENT_BINARY),
            server_binary_name: parser.get_string("SERVER_BIN", DEFAULT_SERVER_BINARY),
            client_use_path: parser.get_bool("CLIENT_USE_PATH", false),
            server_use_path: parser.get_bool("SERVER_USE_PATH", false),
            skip_client: parser.get_bool("SKIP_CLIENT", false),
            skip_server: parser.get_bool("SKIP_SERVER", false),
            cert_dir: parser.get_opt_path("CERT_DIR").unwrap_or(defaults.cert_dir),
            hook_preset_dir: parser
                .get_opt_path("HOOK_DIR")
                .unwrap_or(defaults.hook_preset_dir),
            default_timeout: parser.get_secs("TIMEOUT_SECS", defaults.default_timeout, 3600),
            server_address: parser.get_string("SERVER_ADDRESS", &defaults.server_address),
            server_start_port: parser.get_u16("SERVER_START_PORT", defaults.server_start_port),
            server_start_attempts: parser.get_u64_range(
                "SERVER_START_ATTEMPTS",
                u64::from(defaults.server_start_attempts),
                1,
                100_000,
            ) as u32,
            server_poll_interval: parser.get_millis(
                "SERVER_POLL_MS",
                defaults.server_poll_interval,
                60_000,
            ),
            supervisor: SupervisorConfig {
                output_timeout: parser.get_millis(
                    "OUTPUT_TIMEOUT_MS",
                    defaults.supervisor.output_timeout,
                    60_000,
                ),
                escalation: defaults
                    .supervisor
                    .escalation
                    .iter()
                    .map(|step| EscalationStep {
                        signal: step.signal,
                        grace,
                    })
                    .collect(),
                ..defaults.supervisor
            },
            client_binary_override: None,
            server_binary_override: None,
        }
    }

    /// Use an explicit client binary regardless of lookup settings.
    pub fn with_client_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_binary_override = Some(path.into());
        self
    }

    /// Use an explicit server binary regardless of lookup settings.
    pub fn with_server_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_binary_override = Some(path.into());
        self
    }

    pub fn with_cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = dir.into();
        self
    }

    pub fn with_hook_preset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.hook_preset_dir = dir.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = address.into();
        self
    }

    pub fn with_server_startup(mut self, attempts: u32, interval: Duration) -> Self {
        self.server_start_attempts = attempts;
        self.server_poll_interval = interval;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Path (or bare name for `PATH` lookup) of the program under test.
    pub fn client_binary(&self) -> PathBuf {
        self.client_binary_override.clone().unwrap_or_else(|| {
            binary_location(&self.bin_dir, &self.client_binary_name, self.client_use_path)
        })
    }

    /// Path (or bare name for `PATH` lookup) of the server.
    pub fn server_binary(&self) -> PathBuf {
        self.server_binary_override.clone().unwrap_or_else(|| {
            binary_location(&self.bin_dir, &self.server_binary_name, self.server_use_path)
        })
    }

    /// Fail with a skip when client tests are disabled.
    pub fn skip_client_tests(&self) -> HarnessResult<()> {
        if self.skip_client {
            return Err(HarnessError::Skipped(
                "client tests disabled by PROCTEST_SKIP_CLIENT".to_string(),
            ));
        }
        Ok(())
    }

    /// Fail with a skip when server tests are disabled.
    pub fn skip_server_tests(&self) -> HarnessResult<()> {
        if self.skip_server {
            return Err(HarnessError::Skipped(
                "server tests disabled by PROCTEST_SKIP_SERVER".to_string(),
            ));
        }
        Ok(())
    }
}

/// `bin_dir/name`, or the `PATH` match for `name` when `use_path` is set.
pub fn binary_location(bin_dir: &Path, name: &str, use_path: bool) -> PathBuf {
    if use_path {
        which::which(name).unwrap_or_else(|_| PathBuf::from(name))
    } else {
        bin_dir.join(name)
    }
}
