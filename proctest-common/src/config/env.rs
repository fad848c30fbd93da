//! Environment variable parsing with type safety.
//!
//! Provides a prefix-aware parser that collects every problem it finds so
//! a misconfigured environment is reported in one go.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

type Lookup = Box<dyn Fn(&str) -> Option<String>>;

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Parser over the process environment with the `PROCTEST_` prefix.
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Parser over an arbitrary variable source.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + 'static) -> Self {
        Self {
            prefix: "PROCTEST_",
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Parser over a fixed map; names in the map include the prefix.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self::with_lookup(move |name| vars.get(name).cloned())
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = self.var_name(name);
        (self.lookup)(&var).map(|value| (var, value))
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        self.raw(name)
            .map(|(_, value)| value)
            .unwrap_or_else(|| default.to_string())
    }

    /// Non-empty string, if set.
    pub fn get_opt_string(&mut self, name: &str) -> Option<String> {
        self.raw(name)
            .map(|(_, value)| value)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn get_opt_path(&mut self, name: &str) -> Option<PathBuf> {
        self.get_opt_string(name).map(PathBuf::from)
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let Some((var, value)) = self.raw(name) else {
            return default;
        };
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                default
            }
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> u64 {
        let Some((var, value)) = self.raw(name) else {
            return default;
        };
        match value.trim().parse::<u64>() {
            Ok(n) if (min..=max).contains(&n) => n,
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                default
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned integer".to_string(),
                    value,
                });
                default
            }
        }
    }

    pub fn get_u16(&mut self, name: &str, default: u16) -> u16 {
        self.get_u64_range(name, u64::from(default), 1, u64::from(u16::MAX)) as u16
    }

    pub fn get_secs(&mut self, name: &str, default: Duration, max_secs: u64) -> Duration {
        Duration::from_secs(self.get_u64_range(name, default.as_secs(), 1, max_secs))
    }

    pub fn get_millis(&mut self, name: &str, default: Duration, max_ms: u64) -> Duration {
        Duration::from_millis(self.get_u64_range(name, default.as_millis() as u64, 1, max_ms))
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
