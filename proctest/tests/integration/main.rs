#[path = "../common/mod.rs"]
mod common;

mod cli_tests;
mod server_tests;
mod session_tests;

#[ctor::ctor]
fn init_logging() {
    common::init_test_logging();
}
