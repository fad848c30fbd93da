//! Stand-in command-line client used by the harness's own tests.
//!
//! Reads its data directory from `TASKDATA` and its configuration from
//! `TASKRC`, runs executable hooks from `<data>/hooks` when `hooks` is on,
//! and can push pending tasks to a mock server with `sync`.

#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use proctest_common::logging::{LogConfig, init_logging};
use proctest_common::{HookKind, ProcessInvocation, Supervisor, SupervisorConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "proctest-mock-client")]
#[command(version, about = "Mock task client for harness tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set a configuration variable, or remove it when no value is given
    Config { key: String, value: Option<String> },

    /// Add a task
    Add {
        #[arg(required = true, trailing_var_arg = true)]
        words: Vec<String>,
    },

    /// Print pending tasks as a JSON array
    Export,

    /// Print the arguments
    Echo {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },

    /// Copy stdin to stdout
    Cat,

    /// Exit with a non-zero code
    Fail {
        #[arg(default_value = "1")]
        code: i32,
    },

    /// Sleep for a number of seconds
    Sleep { secs: f64 },

    /// Push pending tasks to the configured server
    Sync,

    /// Print environment details
    Diag,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Add { .. } => "add",
            Self::Export => "export",
            Self::Echo { .. } => "echo",
            Self::Cat => "cat",
            Self::Fail { .. } => "fail",
            Self::Sleep { .. } => "sleep",
            Self::Sync => "sync",
            Self::Diag => "diag",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Task {
    uuid: String,
    status: String,
    description: String,
}

/// Ordered `key=value` lines of the rc file. Later assignments win.
struct Rc {
    path: PathBuf,
    lines: Vec<String>,
}

impl Rc {
    fn load(path: PathBuf) -> Result<Self> {
        let lines = match fs::read_to_string(&path) {
            Ok(text) => text.lines().map(str::to_string).collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
        };
        Ok(Self { path, lines })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .filter_map(|line| line.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
    }

    fn set(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        self.lines
            .retain(|line| line.split_once('=').is_none_or(|(k, _)| k.trim() != key));
        if let Some(value) = value {
            self.lines.push(format!("{key}={value}"));
        }
        let mut text = self.lines.join("\n");
        text.push('\n');
        fs::write(&self.path, text)?;
        Ok(())
    }

    fn hooks_enabled(&self) -> bool {
        matches!(
            self.get("hooks").map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "on" | "yes" | "true")
        )
    }
}

struct Client {
    data: PathBuf,
    rc: Rc,
    args: String,
    supervisor: Supervisor,
}

impl Client {
    fn from_env(args: String) -> Result<Self> {
        let data = std::env::var_os("TASKDATA")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("TASKDATA is not set"))?;
        let rc = std::env::var_os("TASKRC")
            .map(PathBuf::from)
            .unwrap_or_else(|| data.join(".taskrc"));
        Ok(Self {
            data,
            rc: Rc::load(rc)?,
            args,
            supervisor: Supervisor::new(SupervisorConfig::default()),
        })
    }

    fn pending_file(&self) -> PathBuf {
        self.data.join("pending.data")
    }

    fn pending(&self) -> Result<Vec<Task>> {
        let text = match fs::read_to_string(self.pending_file()) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    /// Executable hooks of `kind`, in name order.
    fn hook_scripts(&self, kind: HookKind) -> Vec<PathBuf> {
        if !self.rc.hooks_enabled() {
            return Vec::new();
        }
        let Ok(entries) = fs::read_dir(self.data.join("hooks")) else {
            return Vec::new();
        };
        let mut scripts: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(kind.prefix()))
            })
            .filter(|path| {
                fs::metadata(path)
                    .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            })
            .collect();
        scripts.sort();
        scripts
    }

    /// Run every hook of `kind` with `input` on stdin; returns each hook's
    /// stdout lines.
    fn run_hooks(&self, kind: HookKind, command: &str, input: &str) -> Result<Vec<Vec<String>>> {
        let mut outputs = Vec::new();
        for script in self.hook_scripts(kind) {
            let invocation = ProcessInvocation::new(&script)
                .args([
                    "api:2".to_string(),
                    format!("args:{}", self.args),
                    format!("command:{command}"),
                    format!("rc:{}", self.rc.path.display()),
                    format!("data:{}", self.data.display()),
                    format!("version:{VERSION}"),
                ])
                .input(input.to_string());
            let result = self.supervisor.run(&invocation)?;
            debug!(hook = %script.display(), exit_code = result.exit_code, "hook finished");
            let lines: Vec<String> = result.stdout.lines().map(str::to_string).collect();
            if !result.success() {
                for line in &lines {
                    println!("{line}");
                }
                bail!("Hook Error: {} exited with {}", script.display(), result.exit_code);
            }
            outputs.push(lines);
        }
        Ok(outputs)
    }

    fn add(&self, words: &[String]) -> Result<()> {
        let mut task = Task {
            uuid: Uuid::new_v4().to_string(),
            status: "pending".to_string(),
            description: words.join(" "),
        };
        let mut input = serde_json::to_string(&task)?;
        for lines in self.run_hooks(HookKind::OnAdd, "add", &format!("{input}\n"))? {
            let mut lines = lines.into_iter();
            let first = lines
                .next()
                .ok_or_else(|| anyhow!("Hook Error: Expected 1 JSON task, got 0"))?;
            task = serde_json::from_str(&first)
                .map_err(|e| anyhow!("Hook Error: JSON syntax error in '{first}': {e}"))?;
            for feedback in lines {
                println!("{feedback}");
            }
            input = serde_json::to_string(&task)?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.pending_file())?;
        writeln!(file, "{input}")?;
        println!("Created task {}.", self.pending()?.len());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let server = self
            .rc
            .get("taskd.server")
            .ok_or_else(|| anyhow!("taskd.server is not configured"))?;
        let credentials = self
            .rc
            .get("taskd.credentials")
            .ok_or_else(|| anyhow!("taskd.credentials is not configured"))?;

        let mut stream = TcpStream::connect(server).with_context(|| format!("cannot reach {server}"))?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        writeln!(stream, "{credentials}")?;
        for task in self.pending()? {
            writeln!(stream, "{}", serde_json::to_string(&task)?)?;
        }
        stream.shutdown(Shutdown::Write)?;

        let mut reply = String::new();
        BufReader::new(&stream).read_line(&mut reply)?;
        match reply.trim().strip_prefix("ok ") {
            Some(count) => {
                println!("Sync successful. {count} tasks uploaded.");
                Ok(())
            }
            None => bail!("Sync failed: {}", reply.trim()),
        }
    }

    fn diag(&self) {
        println!("proctest-mock-client {VERSION}");
        println!("Data: {}", self.data.display());
        println!("Config: {}", self.rc.path.display());
        println!("Hooks: {}", if self.rc.hooks_enabled() { "enabled" } else { "disabled" });
        for kind in HookKind::ALL {
            for script in self.hook_scripts(kind) {
                println!("  {kind}: {}", script.display());
            }
        }
    }
}

fn execute(client: &mut Client, command: &Commands) -> Result<i32> {
    match command {
        Commands::Config { key, value } => {
            // Swallow the confirmation answer if one was piped in.
            let mut answer = String::new();
            let _ = io::stdin().read_line(&mut answer);
            client.rc.set(key, value.as_deref())?;
            println!("Config file {} modified.", client.rc.path.display());
        }
        Commands::Add { words } => client.add(words)?,
        Commands::Export => {
            println!("{}", serde_json::to_string(&client.pending()?)?);
        }
        Commands::Echo { words } => println!("{}", words.join(" ")),
        Commands::Cat => {
            let mut input = String::new();
            io::stdin().read_to_string(&mut input)?;
            print!("{input}");
        }
        Commands::Fail { code } => {
            eprintln!("failing with exit code {code}");
            return Ok(*code);
        }
        Commands::Sleep { secs } => std::thread::sleep(Duration::from_secs_f64(secs.max(0.0))),
        Commands::Sync => client.sync()?,
        Commands::Diag => client.diag(),
    }
    Ok(0)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logging_guards = init_logging(&LogConfig::from_env("warn").with_stderr())?;

    let args = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let mut client = Client::from_env(args)?;
    let name = cli.command.name();
    let with_hooks = !matches!(cli.command, Commands::Config { .. });

    let result = (|| -> Result<i32> {
        if with_hooks {
            for lines in client.run_hooks(HookKind::OnLaunch, name, "")? {
                for line in lines {
                    println!("{line}");
                }
            }
        }
        let code = execute(&mut client, &cli.command)?;
        if with_hooks {
            let tasks: String = client
                .pending()?
                .iter()
                .map(|task| serde_json::to_string(task).map(|json| json + "\n"))
                .collect::<Result<_, _>>()?;
            for lines in client.run_hooks(HookKind::OnExit, name, &tasks)? {
                for line in lines {
                    println!("{line}");
                }
            }
        }
        Ok(code)
    })();

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "command failed");
            eprintln!("{e}");
            1
        }
    };
    io::stdout().flush()?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
