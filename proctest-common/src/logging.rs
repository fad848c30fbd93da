//! Tracing subscriber setup for the harness binaries.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::EnvParser;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("log file path has no file name: {0}")]
    InvalidFile(PathBuf),

    #[error("failed to create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Console output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `proctest_common=debug`.
    pub filter: String,
    pub format: LogFormat,
    /// Additional JSON log file, written through a background thread.
    pub file: Option<PathBuf>,
    pub stderr: bool,
}

impl LogConfig {
    pub fn new(default_level: &str) -> Self {
        Self {
            filter: default_level.to_string(),
            format: LogFormat::default(),
            file: None,
            stderr: false,
        }
    }

    /// Read `PROCTEST_LOG`, `PROCTEST_LOG_FORMAT` and `PROCTEST_LOG_FILE`.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_parser(&mut EnvParser::new(), default_level)
    }

    pub fn from_parser(parser: &mut EnvParser, default_level: &str) -> Self {
        let format = parser
            .get_opt_string("LOG_FORMAT")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        Self {
            filter: parser.get_string("LOG", default_level),
            format,
            file: parser.get_opt_path("LOG_FILE"),
            stderr: false,
        }
    }

    /// Write console output to stderr, keeping stdout for program output.
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.filter = level.to_string();
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }
}

/// Keeps the background log writer alive; drop it last.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter =
        EnvFilter::try_new(&config.filter).map_err(|e| LoggingError::InvalidFilter {
            filter: config.filter.clone(),
            reason: e.to_string(),
        })?;

    let writer = if config.stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let console = match config.format {
        LogFormat::Pretty => fmt::layer().pretty().with_writer(writer).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(writer).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    };

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuards { _file: guard })
}

fn file_appender(path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender, LoggingError> {
    let name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidFile(path.to_path_buf()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|source| LoggingError::Directory {
        path: dir.clone(),
        source,
    })?;
    Ok(tracing_appender::rolling::never(dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_config_from_parser() {
        let vars: HashMap<String, String> = [
            ("PROCTEST_LOG", "proctest_common=trace"),
            ("PROCTEST_LOG_FORMAT", "json"),
            ("PROCTEST_LOG_FILE", "/tmp/proctest/run.jsonl"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = LogConfig::from_parser(&mut EnvParser::from_map(vars), "info");
        assert_eq!(config.filter, "proctest_common=trace");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/proctest/run.jsonl")));
    }

    #[test]
    fn test_defaults_and_builders() {
        let config = LogConfig::from_parser(&mut EnvParser::from_map(HashMap::new()), "warn")
            .with_stderr()
            .with_level("debug");
        assert_eq!(config.filter, "debug");
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.stderr);
        assert_eq!(config.file, None);
    }

    #[test]
    fn test_invalid_filter_is_rejected_before_install() {
        let err = init_logging(&LogConfig::new("proctest=loudest")).err().unwrap();
        assert!(matches!(err, LoggingError::InvalidFilter { .. }));
    }

    #[test]
    fn test_file_appender_requires_file_name() {
        assert!(matches!(
            file_appender(Path::new("/")),
            Err(LoggingError::InvalidFile(_))
        ));
    }
}
