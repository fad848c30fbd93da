//! Stand-in sync server used by the harness's own tests.
//!
//! Speaks the administrative surface the harness drives (`init`, `config`,
//! `add org`, `add user`, `server`) and a tiny line protocol: a client sends
//! `org/user/key` followed by data lines, the server appends them to that
//! user's `tx.data` and answers `ok <n>`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use proctest_common::logging::{LogConfig, init_logging};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Exit code of a startup crash requested through `mock.startup=crash`.
const CRASH_EXIT_CODE: i32 = 3;

#[derive(Parser)]
#[command(name = "proctest-mock-server")]
#[command(author, version, about = "Mock sync server for harness tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty data directory
    Init {
        #[arg(long)]
        data: PathBuf,
    },

    /// Set or remove a configuration variable
    Config {
        /// Skip confirmation
        #[arg(long)]
        force: bool,

        #[arg(long)]
        data: PathBuf,

        key: String,

        /// Remove the variable when absent
        value: Option<String>,
    },

    /// Register an organization or user
    Add {
        #[arg(long)]
        data: PathBuf,

        #[command(subcommand)]
        entity: Entity,
    },

    /// Serve until SIGTERM
    Server {
        #[arg(long)]
        data: PathBuf,
    },
}

#[derive(Subcommand)]
enum Entity {
    Org { name: String },
    User { org: String, name: String },
}

/// `key=value` configuration stored in `<data>/config`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ServerConfig {
    values: BTreeMap<String, String>,
}

impl ServerConfig {
    fn path(data: &Path) -> PathBuf {
        data.join("config")
    }

    fn load(data: &Path) -> Result<Self> {
        let path = Self::path(data);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}; run init first", path.display()))?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let values = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        Self { values }
    }

    fn render(&self) -> String {
        self.values
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect()
    }

    fn save(&self, data: &Path) -> Result<()> {
        fs::write(Self::path(data), self.render())?;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

fn users_dir(root: &Path, org: &str) -> PathBuf {
    root.join("orgs").join(org).join("users")
}

fn init(data: &Path) -> Result<i32> {
    fs::create_dir_all(data.join("orgs"))?;
    if !ServerConfig::path(data).exists() {
        ServerConfig::default().save(data)?;
    }
    println!("Initialized data directory {}", data.display());
    Ok(0)
}

fn config(data: &Path, force: bool, key: &str, value: Option<&str>) -> Result<i32> {
    if !force {
        debug!("confirmation skipped for mock server");
    }
    let mut config = ServerConfig::load(data)?;
    match value {
        Some(value) => {
            config.values.insert(key.to_string(), value.to_string());
        }
        None => {
            config.values.remove(key);
        }
    }
    config.save(data)?;
    println!("Config file {} modified.", ServerConfig::path(data).display());
    Ok(0)
}

fn add_org(data: &Path, name: &str) -> Result<i32> {
    let dir = users_dir(data, name);
    if dir.exists() {
        println!("Organization '{name}' already exists.");
        return Ok(1);
    }
    fs::create_dir_all(&dir)?;
    println!("Created organization '{name}'");
    Ok(0)
}

fn add_user(data: &Path, org: &str, name: &str) -> Result<i32> {
    let dir = users_dir(data, org);
    if !dir.is_dir() {
        println!("Organization '{org}' does not exist.");
        return Ok(1);
    }
    for entry in fs::read_dir(&dir)? {
        let config = entry?.path().join("config");
        let Ok(text) = fs::read_to_string(&config) else {
            continue;
        };
        if ServerConfig::parse(&text).get("user") == Some(name) {
            println!("User '{name}' already exists.");
            return Ok(1);
        }
    }

    let key = Uuid::new_v4().to_string();
    let user_dir = dir.join(&key);
    fs::create_dir_all(&user_dir)?;
    fs::write(user_dir.join("config"), format!("user={name}\n"))?;
    fs::write(user_dir.join("tx.data"), "")?;
    println!("Created user '{name}' for organization '{org}'");
    println!("New user key: {key}");
    Ok(0)
}

async fn resolve(config: &ServerConfig) -> Result<SocketAddr> {
    let server = config
        .get("server")
        .ok_or_else(|| anyhow!("no 'server' address configured"))?;
    let want_v4 = config
        .get("family")
        .is_some_and(|family| family.eq_ignore_ascii_case("IPv4"));
    let mut candidates: Vec<SocketAddr> = tokio::net::lookup_host(server).await?.collect();
    if want_v4 {
        candidates.retain(SocketAddr::is_ipv4);
    }
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("'{server}' does not resolve to a usable address"))
}

/// Receive one sync: a credentials line then data lines until EOF.
async fn handle(stream: TcpStream, root: PathBuf) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let Some(credentials) = lines.next_line().await? else {
        // Port probe.
        return Ok(());
    };

    let mut parts = credentials.splitn(3, '/');
    let (Some(org), Some(_user), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
        write.write_all(b"error malformed credentials\n").await?;
        return Ok(());
    };
    let tx_data = users_dir(&root, org).join(key).join("tx.data");
    if !tx_data.is_file() {
        warn!(org, key, "sync from unknown user");
        write.write_all(b"error unknown user\n").await?;
        return Ok(());
    }

    let mut received = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if !line.is_empty() {
            received.push(line);
        }
    }
    let mut content = tokio::fs::read_to_string(&tx_data).await?;
    for line in &received {
        content.push_str(line);
        content.push('\n');
    }
    tokio::fs::write(&tx_data, content).await?;
    info!(org, key, lines = received.len(), "sync stored");
    write
        .write_all(format!("ok {}\n", received.len()).as_bytes())
        .await?;
    Ok(())
}

async fn serve(data: &Path, mut config: ServerConfig) -> Result<i32> {
    // Registered before binding so an early reload is never fatal.
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    match config.get("mock.startup") {
        Some("crash") => {
            error!("startup crash requested");
            return Ok(CRASH_EXIT_CODE);
        }
        Some("silent") => {
            info!("not binding; waiting for termination");
            terminate.recv().await;
            return Ok(0);
        }
        _ => {}
    }

    let address = resolve(&config).await?;
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("cannot bind {address}"))?;
    let pid_file = config.get("pid.file").map(PathBuf::from);
    if let Some(pid_file) = &pid_file {
        fs::write(pid_file, format!("{}\n", std::process::id()))?;
    }
    let root = config
        .get("root")
        .map(PathBuf::from)
        .unwrap_or_else(|| data.to_path_buf());
    info!(%address, pid = std::process::id(), "server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "connection accepted");
                let root = root.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle(stream, root).await {
                        debug!(%peer, error = %e, "connection failed");
                    }
                });
            }
            _ = hangup.recv() => {
                match ServerConfig::load(data) {
                    Ok(reloaded) => {
                        config = reloaded;
                        info!(entries = config.values.len(), "configuration reloaded");
                    }
                    Err(e) => warn!(error = %e, "configuration reload failed"),
                }
            }
            _ = terminate.recv() => {
                info!("terminating");
                if let Some(pid_file) = &pid_file {
                    let _ = fs::remove_file(pid_file);
                }
                return Ok(0);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if let Commands::Server { data } = &cli.command {
        let config = ServerConfig::load(data)?;
        if let Some(log) = config.get("log") {
            log_config = log_config.with_file(log);
        }
    }
    let logging_guards = init_logging(&log_config)?;

    let code = match &cli.command {
        Commands::Init { data } => init(data)?,
        Commands::Config {
            force,
            data,
            key,
            value,
        } => config(data, *force, key, value.as_deref())?,
        Commands::Add { data, entity } => match entity {
            Entity::Org { name } => add_org(data, name)?,
            Entity::User { org, name } => add_user(data, org, name)?,
        },
        Commands::Server { data } => {
            let config = ServerConfig::load(data)?;
            if config.get("server").is_none() {
                bail!("server address missing from {}", ServerConfig::path(data).display());
            }
            serve(data, config).await?
        }
    };

    // Flush the file log before exiting.
    drop(logging_guards);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip_keeps_values() {
        let config = ServerConfig::parse("server=localhost:1\nclient.allow=^task [2-9]\n");
        assert_eq!(config.get("client.allow"), Some("^task [2-9]"));
        assert_eq!(ServerConfig::parse(&config.render()), config);
    }

    #[test]
    fn test_add_user_prints_key_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path()).unwrap();
        assert_eq!(add_org(dir.path(), "org").unwrap(), 0);
        assert_eq!(add_org(dir.path(), "org").unwrap(), 1);
        assert_eq!(add_user(dir.path(), "org", "alice").unwrap(), 0);
        assert_eq!(add_user(dir.path(), "org", "alice").unwrap(), 1);
        assert_eq!(add_user(dir.path(), "missing", "bob").unwrap(), 1);

        let users: Vec<_> = fs::read_dir(users_dir(dir.path(), "org"))
            .unwrap()
            .collect();
        assert_eq!(users.len(), 1);
    }
}
