use std::path::Path;

use anyhow::{Context, Result};
use proctest_common::hooks::log::HookLog;

pub fn run(dir: &Path, name: &str) -> Result<i32> {
    let log = HookLog::new(dir, name);
    let record = log
        .record()
        .with_context(|| format!("failed to read logs of hook {name}"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(0)
}
