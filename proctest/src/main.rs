//! proctest - black-box test runner
//!
//! Runs commands under supervision, hands out free ports, inspects hook logs
//! and data files, and executes TOML test suites as a TAP stream.

#![forbid(unsafe_code)]

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use proctest_common::logging::{LogConfig, init_logging};

use commands::ExpectArg;

#[derive(Parser)]
#[command(name = "proctest")]
#[command(author, version, about = "Black-box test runner for a CLI and its server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command with a timeout and report how it ended
    Run {
        /// Kill the command after this long (e.g. "5s", "500ms")
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Capture stderr into stdout in arrival order
        #[arg(long)]
        merge: bool,

        /// Text fed to the command's stdin
        #[arg(long)]
        input: Option<String>,

        /// Required outcome; a mismatch exits non-zero
        #[arg(long, value_enum)]
        expect: Option<ExpectArg>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Reserve free TCP ports and print them
    Port {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        /// First port to probe
        #[arg(long, default_value_t = proctest_common::ports::DEFAULT_START_PORT)]
        start: u16,

        /// How many ports to reserve
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Print each line of a data file as JSON
    Datafile {
        path: PathBuf,
    },

    /// Print the parsed logs of a logged hook
    HookLog {
        /// Hooks directory
        dir: PathBuf,

        /// Hook name
        name: String,
    },

    /// Run a TOML test suite and print TAP
    Suite {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let logging_guards = init_logging(&log_config)?;

    let code = match cli.command {
        Commands::Run {
            timeout,
            merge,
            input,
            expect,
            json,
            command,
        } => commands::run::run(commands::run::RunArgs {
            timeout,
            merge,
            input,
            expect,
            json,
            command,
        })?,
        Commands::Port {
            address,
            start,
            count,
        } => commands::port::run(&address, start, count)?,
        Commands::Datafile { path } => commands::datafile::run(&path)?,
        Commands::HookLog { dir, name } => commands::hook_log::run(&dir, &name)?,
        Commands::Suite { path } => commands::suite::run(&path)?,
    };

    // Flush the file log before exiting.
    drop(logging_guards);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
