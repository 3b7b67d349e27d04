use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command vector has no program")]
    EmptyCommand,
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Why signal forwarding could not be set up for a run. Never fatal: the
/// command still runs, only without pause/resume/hangup support.
#[derive(Debug, Error)]
pub enum SignalSetupError {
    #[error("another command is already receiving forwarded signals")]
    AlreadyArmed,
    #[error("failed to install handler for signal {signal}: {source}")]
    Install {
        signal: libc::c_int,
        #[source]
        source: io::Error,
    },
}
