use std::time::Duration;

use anyhow::Result;
use proctest_common::{Expectation, HarnessError, ProcessInvocation, Supervisor, WaitKind};
use tracing::{debug, warn};

use super::{ExpectArg, load_config, shell_status};

pub struct RunArgs {
    pub timeout: Duration,
    pub merge: bool,
    pub input: Option<String>,
    pub expect: Option<ExpectArg>,
    pub json: bool,
    pub command: Vec<String>,
}

pub fn run(args: RunArgs) -> Result<i32> {
    let config = load_config()?;
    let supervisor = Supervisor::new(config.supervisor.clone());

    let mut invocation = ProcessInvocation::from_argv(args.command)?
        .timeout(args.timeout)
        .merge_streams(args.merge);
    if let Some(input) = args.input {
        invocation = invocation.input(input);
    }
    debug!(command = ?invocation.command_line(), "running");

    let result = match supervisor.run(&invocation) {
        Ok(result) => result,
        Err(HarnessError::Timeout {
            wait: WaitKind::Output,
            after,
            partial_stdout,
            partial_stderr,
        }) => {
            warn!(?after, "command output never arrived");
            print!("{partial_stdout}");
            eprint!("{partial_stderr}");
            return Ok(124);
        }
        Err(e) => return Err(e.into()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.stdout);
        if let Some(stderr) = &result.stderr {
            eprint!("{stderr}");
        }
    }

    let code = match args.expect {
        Some(expect) => {
            let expectation = Expectation::from(expect);
            if expectation.matches(result.exit_code) {
                0
            } else {
                eprintln!(
                    "expected {} exit status, got {}{}",
                    expectation,
                    result.exit_code,
                    if result.timed_out { " (timed out)" } else { "" }
                );
                1
            }
        }
        None => shell_status(result.exit_code),
    };
    Ok(code)
}
