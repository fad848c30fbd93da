use std::path::Path;

use anyhow::{Context, Result};
use proctest_common::datafile::parse_datafile;

pub fn run(path: &Path) -> Result<i32> {
    let lines = parse_datafile(path)
        .with_context(|| format!("failed to read data file {}", path.display()))?;
    for line in &lines {
        println!("{}", serde_json::to_string(line)?);
    }
    Ok(0)
}
