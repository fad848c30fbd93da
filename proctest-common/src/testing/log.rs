//! Structured test logging for CI debugging.
//!
//! Every harness event emitted while tests run lands as JSONL in
//! `target/test-logs/proctest.jsonl`.
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     proctest_common::testing::init_test_logging();
//! }
//! ```

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static TEST_LOGGING_INIT: Once = Once::new();

/// Initialize JSONL logging for all tests.
///
/// Writes to `target/test-logs/proctest.jsonl` (or `PROCTEST_TEST_LOG_FILE`)
/// and to the libtest capture writer. The level comes from
/// `PROCTEST_TEST_LOG_LEVEL` (default `debug`). Safe to call multiple times.
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let file_layer = create_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
        });

        let test_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level =
            std::env::var("PROCTEST_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "proctest_common={level},proctest={level},test={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(test_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_log_file() -> Option<std::fs::File> {
    if let Ok(custom) = std::env::var("PROCTEST_TEST_LOG_FILE") {
        let custom = PathBuf::from(custom);
        if let Some(parent) = custom.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return open_append(&custom);
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    open_append(&log_dir.join("proctest.jsonl"))
}

// Several test binaries log concurrently; append rather than truncate.
fn open_append(path: &std::path::Path) -> Option<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

/// Find the cargo target directory by searching up from the current dir.
pub fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}
