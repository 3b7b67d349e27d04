//! Runs one external command at a time, streams its output line by line and
//! forwards job-control signals (`SIGTSTP`, `SIGCONT`, `SIGHUP`) received by
//! this process to the child.

mod command;
mod errors;
mod execute;
mod pipe;
mod process_group;
mod signals;

/// Argument list for a child process; never a shell string.
pub use command::CommandVector;
pub use errors::ExecError;
pub use errors::SignalSetupError;
/// Builder and runner for a single controlled child process.
pub use execute::Execute;
pub use execute::LineFilter;
pub use execute::ProcessState;
pub use execute::StderrMode;
