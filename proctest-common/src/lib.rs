//! Black-box test harness for a command-line program and its companion
//! server.
//!
//! The building blocks, leaf first:
//!
//! - [`process`]: run a subprocess to completion or kill it, with bounded
//!   waits at every hand-off.
//! - [`ports`]: hand out TCP ports that no concurrently running server holds.
//! - [`server`]: provision, start, health-check and stop a server instance.
//! - [`client`]: isolated client sessions, optionally bound to a server.
//! - [`hooks`]: install hook scripts and inspect what they were called with.
//! - [`tap`]: report results as a TAP stream.

#![forbid(unsafe_code)]

#[cfg(not(unix))]
compile_error!("proctest-common relies on Unix signals and permission bits");

pub mod client;
pub mod config;
pub mod datafile;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod ports;
pub mod process;
pub mod server;
pub mod tap;
pub mod testing;

pub use client::{ClientSession, FakeTime, RunOptions};
pub use config::HarnessConfig;
pub use error::{
    CommandError, ErrorCategory, Expectation, HarnessError, HarnessResult, WaitKind, ensure,
};
pub use hooks::{Hook, HookKind, Hooks};
pub use ports::{PortAllocator, PortReservation};
pub use process::{ProcessInvocation, ProcessResult, Signal, Supervisor, SupervisorConfig};
pub use server::{ServerInstance, ServerStatus, UserCredentials};
pub use tap::{Outcome, Summary, TapReporter, TapRunner, TestContext};

#[cfg(test)]
#[ctor::ctor]
fn init_test_logging() {
    testing::init_test_logging();
}
