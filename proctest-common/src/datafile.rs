//! Reader for the server's line-oriented transaction logs.
//!
//! Each line is either a JSON object, a legacy bracketed record
//! (`[key:"value" ...]`, rewritten to braces before parsing) or free text.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::error::HarnessResult;

/// One line of a data file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DataLine {
    Json(Value),
    Text(String),
}

impl DataLine {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }
}

/// Parse a data file from disk.
pub fn parse_datafile(path: &Path) -> HarnessResult<Vec<DataLine>> {
    parse_data(&std::fs::read_to_string(path)?)
}

/// Parse data-file content.
pub fn parse_data(content: &str) -> HarnessResult<Vec<DataLine>> {
    content
        .lines()
        .map(|line| {
            let line = match line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                Some(inner) => format!("{{{inner}}}"),
                None => line.to_string(),
            };
            if line.starts_with('{') {
                Ok(DataLine::Json(serde_json::from_str(&line)?))
            } else {
                Ok(DataLine::Text(line))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mixed_lines() {
        let lines = parse_data(
            "{\"uuid\":\"a\",\"status\":\"pending\"}\n[\"uuid\":\"b\"]\n03a5e7c1-0000\n",
        )
        .unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].as_json(), Some(&json!({"uuid": "a", "status": "pending"})));
        assert_eq!(lines[1], DataLine::Json(json!({"uuid": "b"})));
        assert_eq!(lines[2], DataLine::Text("03a5e7c1-0000".to_string()));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(parse_data("{not json}\n").is_err());
    }

    #[test]
    fn test_parse_datafile_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.data");
        std::fs::write(&path, "{\"a\":1}\n").unwrap();
        assert_eq!(parse_datafile(&path).unwrap().len(), 1);
        assert!(parse_datafile(&dir.path().join("missing")).is_err());
    }
}
