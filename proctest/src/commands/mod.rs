//! Subcommand implementations. Each `run` returns the process exit code.

pub mod datafile;
pub mod hook_log;
pub mod port;
pub mod run;
pub mod suite;

use anyhow::{Result, anyhow};
use clap::ValueEnum;
use proctest_common::{Expectation, HarnessConfig};
use serde::Deserialize;

/// Expected outcome of a command, as given on the command line or in a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectArg {
    Success,
    Failure,
}

impl From<ExpectArg> for Expectation {
    fn from(arg: ExpectArg) -> Self {
        match arg {
            ExpectArg::Success => Expectation::Success,
            ExpectArg::Failure => Expectation::Failure,
        }
    }
}

/// Harness settings from `PROCTEST_*` variables, reporting every bad one.
pub fn load_config() -> Result<HarnessConfig> {
    HarnessConfig::from_env().map_err(|errors| {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow!("invalid environment: {}", details.join("; "))
    })
}

/// Shell-style status for a harness exit code: signal deaths become `128+N`.
pub fn shell_status(exit_code: i32) -> i32 {
    if exit_code < 0 {
        128 - exit_code
    } else {
        exit_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_status() {
        assert_eq!(shell_status(0), 0);
        assert_eq!(shell_status(3), 3);
        assert_eq!(shell_status(-9), 137);
        assert_eq!(shell_status(-15), 143);
    }

    #[test]
    fn test_expect_arg_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            expect: ExpectArg,
        }
        let parsed: Wrapper = toml::from_str("expect = \"failure\"").unwrap();
        assert_eq!(Expectation::from(parsed.expect), Expectation::Failure);
    }
}
