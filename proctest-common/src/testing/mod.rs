//! Test-only support shared by unit and integration tests.

pub mod log;

pub use log::{find_target_dir, init_test_logging};
