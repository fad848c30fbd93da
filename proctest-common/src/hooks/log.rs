//! Parsing of the logs written by the hook wrapper script.
//!
//! Input log (`original_<name>.log.in`), one block per call:
//!
//! ```text
//! % Called at 1414874711 with 'arg1 arg2'
//! {"description":"JSON received on stdin"}
//! ```
//!
//! Output log (`original_<name>.log.out`), one block per call:
//!
//! ```text
//! {"description":"JSON emitted on stdout"}
//! Free-form feedback message
//! ! Exit code: 0
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};

const CALL_PREFIX: &str = "% Called at ";
const EXIT_PREFIX: &str = "! Exit code: ";

/// One invocation of a logged hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookCall {
    pub timestamp: DateTime<Utc>,
    /// Arguments as the wrapper saw them, space-joined.
    pub args: String,
}

/// A line that looked like JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonLine {
    Valid(Value),
    /// Kept instead of failing the parse so tests can assert on it.
    Invalid { original: String, error: String },
}

impl JsonLine {
    pub fn decode(line: &str) -> Self {
        match serde_json::from_str(line) {
            Ok(value) => Self::Valid(value),
            Err(e) => Self::Invalid {
                original: line.to_string(),
                error: e.to_string(),
            },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Valid(value) => Some(value),
            Self::Invalid { .. } => None,
        }
    }
}

/// Structured view of both log files.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HookLogRecord {
    pub calls: Vec<HookCall>,
    pub input_json: Vec<JsonLine>,
    pub output_json: Vec<JsonLine>,
    /// Non-JSON output lines.
    pub messages: Vec<String>,
    /// Exit code of the most recent call.
    pub exit_code: Option<i32>,
    pub exit_codes: Vec<i32>,
}

impl HookLogRecord {
    /// 1-based positions of malformed JSON replies.
    pub fn invalid_output_positions(&self) -> Vec<usize> {
        self.output_json
            .iter()
            .enumerate()
            .filter(|(_, line)| !line.is_valid())
            .map(|(i, _)| i + 1)
            .collect()
    }
}

/// Parse the wrapper's input and output logs.
pub fn parse_hook_logs(input: &str, output: &str) -> HarnessResult<HookLogRecord> {
    let mut record = HookLogRecord::default();

    for (number, line) in input.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with('%') {
            record.calls.push(parse_call_line(line)?);
        } else if line.starts_with('{') {
            record.input_json.push(JsonLine::decode(line));
        } else {
            return Err(HarnessError::Hook(format!(
                "unexpected content on STDIN log line {}: {line}",
                number + 1
            )));
        }
    }

    for line in output.lines() {
        if let Some(code) = line.strip_prefix(EXIT_PREFIX) {
            let code = code.trim().parse().map_err(|_| {
                HarnessError::Hook(format!("malformed exit code line: {line}"))
            })?;
            record.exit_codes.push(code);
            record.exit_code = Some(code);
        } else if line.starts_with('{') {
            record.output_json.push(JsonLine::decode(line));
        } else {
            record.messages.push(line.to_string());
        }
    }

    Ok(record)
}

/// `% Called at <unix seconds> with '<args>'`
fn parse_call_line(line: &str) -> HarnessResult<HookCall> {
    let malformed = || HarnessError::Hook(format!("malformed call line: {line}"));
    let rest = line.strip_prefix(CALL_PREFIX).ok_or_else(malformed)?;
    let (stamp, args) = rest.split_once(" with ").ok_or_else(malformed)?;

    let seconds: f64 = stamp.trim().parse().map_err(|_| malformed())?;
    let whole = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1e9).round() as u32;
    let timestamp = DateTime::<Utc>::from_timestamp(whole, nanos.min(999_999_999))
        .ok_or_else(malformed)?;

    let args = args
        .strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
        .unwrap_or(args);

    Ok(HookCall {
        timestamp,
        args: args.to_string(),
    })
}

/// Change stamp of the two log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogStamp {
    modified: SystemTime,
    input_len: u64,
    output_len: u64,
}

/// Paths of a logged hook's files plus the parse cache.
#[derive(Debug)]
pub struct HookLog {
    wrapped_file: PathBuf,
    input_log: PathBuf,
    output_log: PathBuf,
    cache: Mutex<Option<(LogStamp, HookLogRecord)>>,
}

impl HookLog {
    /// Layout for hook `name` inside `dir`.
    pub fn new(dir: &Path, name: &str) -> Self {
        let wrapped_file = dir.join(format!("original_{name}"));
        let mut input_log = wrapped_file.clone().into_os_string();
        input_log.push(".log.in");
        let mut output_log = wrapped_file.clone().into_os_string();
        output_log.push(".log.out");
        Self {
            wrapped_file,
            input_log: input_log.into(),
            output_log: output_log.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn wrapped_file(&self) -> &Path {
        &self.wrapped_file
    }

    pub fn input_log(&self) -> &Path {
        &self.input_log
    }

    pub fn output_log(&self) -> &Path {
        &self.output_log
    }

    /// Create both logs empty.
    pub fn create(&self) -> HarnessResult<()> {
        fs::File::create(&self.input_log)?;
        fs::File::create(&self.output_log)?;
        Ok(())
    }

    fn stamp(&self) -> HarnessResult<LogStamp> {
        let input = fs::metadata(&self.input_log)?;
        let output = fs::metadata(&self.output_log)?;
        Ok(LogStamp {
            modified: input.modified()?.max(output.modified()?),
            input_len: input.len(),
            output_len: output.len(),
        })
    }

    /// Parsed logs, re-read only when either file changed.
    pub fn record(&self) -> HarnessResult<HookLogRecord> {
        let stamp = self.stamp()?;
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, record)) = cache.as_ref()
            && *cached == stamp
        {
            return Ok(record.clone());
        }

        let record = parse_hook_logs(
            &fs::read_to_string(&self.input_log)?,
            &fs::read_to_string(&self.output_log)?,
        )?;
        *cache = Some((stamp, record.clone()));
        Ok(record)
    }
}
