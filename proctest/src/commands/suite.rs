//! TOML test suites.
//!
//! A suite names the client (and optionally a server), installs hooks, and
//! lists commands with their expected outcome:
//!
//! ```toml
//! [settings]
//! client = "bin/task"
//! server = "bin/taskd"
//! timeout = "10s"
//!
//! [[hooks]]
//! name = "on-add-check"
//! content = "#!/bin/sh\ncat\n"
//! logged = true
//!
//! [[test]]
//! name = "add creates a task"
//! args = ["add", "one"]
//! stdout_contains = "Created task"
//! hook = { name = "on-add-check", triggered = 1 }
//! ```
//!
//! Relative paths resolve against the suite file's directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use proctest_common::hooks::HookSource;
use proctest_common::process::split_args;
use proctest_common::{
    ClientSession, Expectation, HarnessConfig, HarnessError, HarnessResult, PortAllocator, RunOptions,
    ServerInstance, TapRunner, TestContext, ensure,
};
use regex::Regex;
use serde::Deserialize;
use tracing::{error, info};

use super::{ExpectArg, load_config};

/// Exit code when the suite could not be set up at all.
const BAIL_OUT: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("failed to read suite {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid suite {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid timeout '{value}': {source}")]
    Timeout {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("test '{name}': {reason}")]
    InvalidTest { name: String, reason: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Suite {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub hooks: Vec<HookEntry>,
    #[serde(default, rename = "test")]
    pub tests: Vec<TestEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub client: Option<PathBuf>,
    pub server: Option<PathBuf>,
    pub timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookEntry {
    pub name: String,
    /// Script body; a preset of the same name is copied when absent.
    pub content: Option<String>,
    #[serde(default)]
    pub logged: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestEntry {
    pub name: String,
    pub args: Option<Vec<String>>,
    /// Shell-like command line, split into arguments.
    pub command: Option<String>,
    pub input: Option<String>,
    #[serde(default = "default_expect")]
    pub expect: ExpectArg,
    pub stdout_contains: Option<String>,
    pub stdout_matches: Option<String>,
    pub stderr_contains: Option<String>,
    /// Skip reason; the test is reported but not run.
    pub skip: Option<String>,
    pub hook: Option<HookCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookCheck {
    pub name: String,
    pub triggered: Option<usize>,
    pub exit_code: Option<i32>,
}

fn default_expect() -> ExpectArg {
    ExpectArg::Success
}

impl Suite {
    pub fn load(path: &Path) -> Result<Self, SuiteError> {
        let text = std::fs::read_to_string(path).map_err(|source| SuiteError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, SuiteError> {
        let suite: Suite = toml::from_str(text).map_err(|source| SuiteError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        for test in &suite.tests {
            test.validate()?;
        }
        Ok(suite)
    }

    pub fn timeout(&self) -> Result<Option<Duration>, SuiteError> {
        self.settings
            .timeout
            .as_deref()
            .map(|value| {
                humantime::parse_duration(value).map_err(|source| SuiteError::Timeout {
                    value: value.to_string(),
                    source,
                })
            })
            .transpose()
    }
}

impl TestEntry {
    fn validate(&self) -> Result<(), SuiteError> {
        let invalid = |reason: &str| SuiteError::InvalidTest {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        match (&self.args, &self.command) {
            (Some(_), Some(_)) => return Err(invalid("set either args or command, not both")),
            (None, None) => return Err(invalid("one of args or command is required")),
            _ => {}
        }
        if let Some(pattern) = &self.stdout_matches {
            Regex::new(pattern).map_err(|e| invalid(&e.to_string()))?;
        }
        Ok(())
    }

    fn argv(&self) -> HarnessResult<Vec<String>> {
        match (&self.args, &self.command) {
            (Some(args), _) => Ok(args.clone()),
            (None, Some(line)) => split_args(line),
            (None, None) => Ok(Vec::new()),
        }
    }

    fn execute(&self, session: &ClientSession, ctx: &mut TestContext) -> HarnessResult<()> {
        if let Some(reason) = &self.skip {
            return Err(HarnessError::Skipped(reason.clone()));
        }

        let mut options = RunOptions::default();
        if let Some(input) = &self.input {
            options = options.input(input.clone());
        }
        let expectation = Expectation::from(self.expect);
        let result = session.invoke(self.argv()?, &options)?;
        ctx.record(&result);
        let result = result.expect(expectation)?;

        if let Some(needle) = &self.stdout_contains {
            ensure(
                result.stdout_contains(needle),
                format!("stdout does not contain '{needle}'"),
            )?;
        }
        if let Some(pattern) = &self.stdout_matches {
            let re = Regex::new(pattern)
                .map_err(|e| HarnessError::Conflict(e.to_string()))?;
            ensure(
                re.is_match(&result.stdout),
                format!("stdout does not match /{pattern}/"),
            )?;
        }
        if let Some(needle) = &self.stderr_contains {
            ensure(
                result.stderr_contains(needle),
                format!("stderr does not contain '{needle}'"),
            )?;
        }
        if let Some(check) = &self.hook {
            let hook = session
                .hooks()
                .and_then(|hooks| hooks.get(&check.name))
                .ok_or_else(|| {
                    HarnessError::Hook(format!("no hook named {}", check.name))
                })?;
            if let Some(count) = check.triggered {
                hook.assert_triggered_count(count)?;
            }
            if let Some(code) = check.exit_code {
                hook.assert_exit_code(code)?;
            }
        }
        Ok(())
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Build the session the suite runs in. The session owns the server, so
/// dropping it tears everything down.
fn setup(suite: &Suite, base: &Path, mut config: HarnessConfig) -> Result<ClientSession> {
    if let Some(timeout) = suite.timeout()? {
        config = config.with_default_timeout(timeout);
    }
    if let Some(client) = &suite.settings.client {
        config = config.with_client_binary(resolve(base, client));
    }
    config.skip_client_tests()?;
    let client = config.client_binary();
    if client.components().count() > 1 && !client.is_file() {
        bail!("client binary {} not found", client.display());
    }

    let mut session = ClientSession::new(&config)?;
    if let Some(server) = &suite.settings.server {
        config = config.with_server_binary(resolve(base, server));
        config.skip_server_tests()?;
        let mut server = ServerInstance::new(&config, Arc::new(PortAllocator::new()))?;
        server.start()?;
        info!(server = %server.reservation(), "suite server started");
        session.adopt_server(server)?;
    }

    if !suite.hooks.is_empty() {
        let hooks = session.activate_hooks()?;
        for entry in &suite.hooks {
            let source = match &entry.content {
                Some(content) => HookSource::Inline(content.clone()),
                None => HookSource::Preset,
            };
            hooks.install(&entry.name, source, entry.logged)?;
        }
    }
    Ok(session)
}

pub fn run(path: &Path) -> Result<i32> {
    let suite = Suite::load(path)?;
    let base = path.parent().unwrap_or(Path::new("."));
    let config = load_config()?;

    let session = match setup(&suite, base, config) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "suite setup failed");
            println!("Bail out! {}", e.to_string().replace('\n', " "));
            return Ok(BAIL_OUT);
        }
    };

    let mut runner = TapRunner::new();
    for test in &suite.tests {
        let session = &session;
        runner.add(test.name.clone(), move |ctx| test.execute(session, ctx));
    }
    let summary = runner.run(io::stdout().lock())?;

    Ok(if summary.success() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Suite, SuiteError> {
        Suite::parse(text, Path::new("suite.toml"))
    }

    #[test]
    fn test_parse_full_suite() {
        let suite = parse(
            r##"
            [settings]
            client = "bin/task"
            timeout = "2s"

            [[hooks]]
            name = "on-add-log"
            content = "#!/bin/sh\ncat\n"
            logged = true

            [[test]]
            name = "version"
            command = "--version"
            stdout_matches = "^\\d+"

            [[test]]
            name = "bad"
            args = ["bogus"]
            expect = "failure"
            hook = { name = "on-add-log", triggered = 0 }
            "##,
        )
        .unwrap();

        assert_eq!(suite.tests.len(), 2);
        assert_eq!(suite.hooks.len(), 1);
        assert!(suite.hooks[0].logged);
        assert_eq!(suite.timeout().unwrap(), Some(Duration::from_secs(2)));
        assert_eq!(suite.tests[0].expect, ExpectArg::Success);
        assert_eq!(suite.tests[1].expect, ExpectArg::Failure);
        assert_eq!(suite.tests[0].argv().unwrap(), vec!["--version"]);
        assert_eq!(suite.tests[1].hook.as_ref().unwrap().triggered, Some(0));
    }

    #[test]
    fn test_args_and_command_are_exclusive() {
        let err = parse(
            r#"
            [[test]]
            name = "both"
            args = ["a"]
            command = "a"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("either args or command"));

        let err = parse("[[test]]\nname = \"neither\"\n").unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn test_bad_regex_rejected_at_load() {
        let err = parse(
            r#"
            [[test]]
            name = "re"
            args = []
            stdout_matches = "("
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SuiteError::InvalidTest { .. }));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = parse("[[test]]\nname = \"x\"\nargs = []\nexpected = \"success\"\n").unwrap_err();
        assert!(matches!(err, SuiteError::Parse { .. }));
    }

    #[test]
    fn test_invalid_timeout() {
        let suite = parse("[settings]\ntimeout = \"soon\"\n").unwrap();
        assert!(matches!(suite.timeout(), Err(SuiteError::Timeout { .. })));
    }

    #[test]
    fn test_resolve_relative_paths() {
        let base = Path::new("/suites");
        assert_eq!(resolve(base, Path::new("bin/task")), PathBuf::from("/suites/bin/task"));
        assert_eq!(resolve(base, Path::new("/usr/bin/task")), PathBuf::from("/usr/bin/task"));
    }
}
