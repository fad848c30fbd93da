//! Hook scripts installed into a client session's data directory.
//!
//! Hooks live in `<data>/hooks/` and are named after the extension point
//! that triggers them (`on-add.my-hook`). An enabled hook is executable, a
//! disabled one is present but not executable. A *logged* hook has its real
//! script moved to `original_<name>` and a wrapper installed in its place
//! that records every call, see [`log`].

pub mod log;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult, ensure};
use crate::server::remove_dir_tolerant;
pub use log::{HookCall, HookLog, HookLogRecord, JsonLine, parse_hook_logs};

/// Wrapper script installed in place of a logged hook.
pub const WRAPPER_SCRIPT: &str = include_str!("wrapper.sh");

const MODE_ENABLED: u32 = 0o700;
const MODE_DISABLED: u32 = 0o600;

/// Extension points the program under test triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookKind {
    OnLaunch,
    OnAdd,
    OnModify,
    OnExit,
}

impl HookKind {
    pub const ALL: [HookKind; 4] = [Self::OnLaunch, Self::OnAdd, Self::OnModify, Self::OnExit];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::OnLaunch => "on-launch",
            Self::OnAdd => "on-add",
            Self::OnModify => "on-modify",
            Self::OnExit => "on-exit",
        }
    }

    /// Kind implied by a hook file name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| name.starts_with(kind.prefix()))
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Where a new hook's script comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookSource {
    Inline(String),
    /// Copy the same-named script from the preset directory.
    Preset,
}

/// One installed hook.
#[derive(Debug)]
pub struct Hook {
    name: String,
    kind: Option<HookKind>,
    file: PathBuf,
    log: Option<HookLog>,
}

impl Hook {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` when the name matches no extension point; such a hook is
    /// installed but never triggered.
    pub fn kind(&self) -> Option<HookKind> {
        self.kind
    }

    pub fn is_recognized(&self) -> bool {
        self.kind.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn is_logged(&self) -> bool {
        self.log.is_some()
    }

    pub fn log(&self) -> Option<&HookLog> {
        self.log.as_ref()
    }

    pub fn enable(&self) -> HarnessResult<()> {
        self.set_mode(MODE_ENABLED)
    }

    pub fn disable(&self) -> HarnessResult<()> {
        self.set_mode(MODE_DISABLED)
    }

    fn set_mode(&self, mode: u32) -> HarnessResult<()> {
        fs::set_permissions(&self.file, fs::Permissions::from_mode(mode))?;
        if let Some(log) = &self.log {
            fs::set_permissions(log.wrapped_file(), fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    /// Enabled when the hook (and the wrapped script, if logged) is
    /// executable.
    pub fn is_active(&self) -> bool {
        is_executable(&self.file)
            && self
                .log
                .as_ref()
                .is_none_or(|log| is_executable(log.wrapped_file()))
    }

    /// Parsed call log. Fails for hooks added without logging.
    pub fn logs(&self) -> HarnessResult<HookLogRecord> {
        self.log
            .as_ref()
            .ok_or_else(|| HarnessError::Hook(format!("hook {} is not logged", self.name)))?
            .record()
    }

    pub fn assert_triggered_count(&self, count: usize) -> HarnessResult<()> {
        let calls = self.logs()?.calls;
        ensure(
            calls.len() == count,
            format!(
                "{count} calls expected for {} but found {}: {calls:?}",
                self.name,
                calls.len()
            ),
        )
    }

    pub fn assert_exit_code(&self, code: i32) -> HarnessResult<()> {
        let found = self.logs()?.exit_code;
        ensure(
            found == Some(code),
            format!("Expected exit code {code} for {} but found {found:?}", self.name),
        )
    }

    /// Every JSON reply parsed.
    pub fn assert_valid_json_output(&self) -> HarnessResult<()> {
        for (i, line) in self.logs()?.output_json.iter().enumerate() {
            if let JsonLine::Invalid { original, .. } = line {
                return Err(HarnessError::AssertionFailed(format!(
                    "Invalid JSON found at reply number {} with content {original}",
                    i + 1
                )));
            }
        }
        Ok(())
    }

    /// Every JSON reply failed to parse.
    pub fn assert_invalid_json_output(&self) -> HarnessResult<()> {
        for (i, line) in self.logs()?.output_json.iter().enumerate() {
            if let JsonLine::Valid(value) = line {
                return Err(HarnessError::AssertionFailed(format!(
                    "Valid JSON found at reply number {} with content {value}",
                    i + 1
                )));
            }
        }
        Ok(())
    }

    fn delete(&self) -> HarnessResult<()> {
        remove_hook_file(&self.file)?;
        if let Some(log) = &self.log {
            remove_hook_file(log.wrapped_file())?;
            remove_hook_file(log.input_log())?;
            remove_hook_file(log.output_log())?;
        }
        Ok(())
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Registry of the hooks installed in one session.
#[derive(Debug)]
pub struct Hooks {
    dir: PathBuf,
    preset_dir: PathBuf,
    hooks: BTreeMap<String, Hook>,
}

impl Hooks {
    /// Use `<data_dir>/hooks`, creating it if needed.
    pub fn new(data_dir: &Path, preset_dir: impl Into<PathBuf>) -> HarnessResult<Self> {
        let dir = data_dir.join("hooks");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            preset_dir: preset_dir.into(),
            hooks: BTreeMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn add(&mut self, name: &str, content: impl Into<String>) -> HarnessResult<&Hook> {
        self.install(name, HookSource::Inline(content.into()), false)
    }

    pub fn add_logged(&mut self, name: &str, content: impl Into<String>) -> HarnessResult<&Hook> {
        self.install(name, HookSource::Inline(content.into()), true)
    }

    pub fn add_default(&mut self, name: &str) -> HarnessResult<&Hook> {
        self.install(name, HookSource::Preset, false)
    }

    pub fn add_default_logged(&mut self, name: &str) -> HarnessResult<&Hook> {
        self.install(name, HookSource::Preset, true)
    }

    /// Create, optionally wrap, and enable a hook.
    pub fn install(&mut self, name: &str, source: HookSource, logged: bool) -> HarnessResult<&Hook> {
        let file = self.dir.join(name);
        if self.hooks.contains_key(name) || file.exists() {
            return Err(HarnessError::Hook(format!(
                "Hook with name {name} already exists. Did you forget to remove() it before recreating?"
            )));
        }

        let kind = HookKind::from_name(name);
        if kind.is_none() {
            warn!(hook = name, "not a valid hook type, it will not be triggered");
        }

        match source {
            HookSource::Inline(content) if content.is_empty() => {
                return Err(HarnessError::Hook(format!(
                    "Cannot create hookfile {name} without content. Use a preset hook instead."
                )));
            }
            HookSource::Inline(content) => fs::write(&file, content)?,
            HookSource::Preset => {
                let preset = self.preset_dir.join(name);
                if !preset.is_file() {
                    return Err(HarnessError::Hook(format!(
                        "Hook {} doesn't exist.",
                        preset.display()
                    )));
                }
                fs::copy(&preset, &file)?;
            }
        }

        let log = if logged {
            match wrap(&self.dir, name, &file) {
                Ok(log) => Some(log),
                Err(e) => {
                    let _ = fs::remove_file(&file);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let hook = Hook {
            name: name.to_string(),
            kind,
            file,
            log,
        };
        hook.enable()?;
        debug!(hook = name, logged, "hook installed");
        Ok(self.hooks.entry(name.to_string()).or_insert(hook))
    }

    pub fn get(&self, name: &str) -> Option<&Hook> {
        self.hooks.get(name)
    }

    /// Delete a hook and, for logged hooks, its wrapped script and logs.
    pub fn remove(&mut self, name: &str) -> HarnessResult<()> {
        let hook = self
            .hooks
            .remove(name)
            .ok_or_else(|| HarnessError::Hook(format!("Hook {name} is not on record")))?;
        hook.delete()?;
        debug!(hook = name, "hook removed");
        Ok(())
    }

    /// Remove every hook file and forget all registrations.
    pub fn clear(&mut self) -> HarnessResult<()> {
        self.hooks.clear();
        remove_dir_tolerant(&self.dir)?;
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.values()
    }

    pub fn enabled(&self) -> Vec<&str> {
        self.iter().filter(|h| h.is_active()).map(Hook::name).collect()
    }

    pub fn disabled(&self) -> Vec<&str> {
        self.iter().filter(|h| !h.is_active()).map(Hook::name).collect()
    }
}

impl fmt::Display for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |names: Vec<&str>| {
            if names.is_empty() {
                "None".to_string()
            } else {
                names.join(", ")
            }
        };
        write!(
            f,
            "<Hooks: enabled: {} | disabled: {}>",
            list(self.enabled()),
            list(self.disabled())
        )
    }
}

/// Move `file` aside and put the logging wrapper in its place.
fn wrap(dir: &Path, name: &str, file: &Path) -> HarnessResult<HookLog> {
    let log = HookLog::new(dir, name);
    if log.wrapped_file().exists() {
        return Err(HarnessError::Hook(format!(
            "Hook {} already exists.",
            log.wrapped_file().display()
        )));
    }
    log.create()?;
    fs::rename(file, log.wrapped_file())?;
    fs::write(file, WRAPPER_SCRIPT)?;
    Ok(log)
}

fn remove_hook_file(path: &Path) -> HarnessResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(HarnessError::Hook(format!(
            "Hook file {} was not found in the hooks folder",
            path.display()
        ))),
        other => Ok(other?),
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.permissions().mode() & 0o111 != 0)
}
