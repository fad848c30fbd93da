//! Subprocess supervision.

mod invocation;
mod signal;
mod supervisor;

pub use invocation::{
    DEFAULT_TIMEOUT, ProcessInvocation, ProcessResult, inherited_env, split_args,
};
pub use signal::{
    Signal, exit_code_of, send_signal, signal_process_group, signal_process_group_or_pid,
};
pub use supervisor::{EscalationStep, Supervisor, SupervisorConfig};
