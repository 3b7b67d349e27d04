use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::command::CommandVector;
use crate::errors::ExecError;
use crate::pipe::SpawnedChild;
use crate::pipe::spawn_child;
use crate::process_group::kill_process_group;
use crate::signals::ForwardedSignal;
use crate::signals::SignalGuard;

/// How long to keep reading output after the child exited. A grandchild
/// that inherited the pipe must not keep the run alive forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Transforms one output line. Returning an empty string drops the line.
pub type LineFilter = Box<dyn Fn(String) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrMode {
    /// Deliver stderr lines through the same callback as stdout.
    #[default]
    Join,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    /// `forwarding` is true when this run owns the process-wide signal
    /// dispatcher.
    Running { pid: u32, forwarding: bool },
    Paused { pid: u32 },
    Terminated { exit_code: i32 },
}

/// Runs an external command and hands its output to a callback.
///
/// `SIGTSTP` and `SIGCONT` sent to this process are forwarded to the command
/// as `SIGSTOP`/`SIGCONT` while it runs; `SIGHUP` kills it. Only one `Execute`
/// per process receives forwarded signals at a time; others run unarmed.
pub struct Execute {
    command: CommandVector,
    filters: Vec<LineFilter>,
    stderr: StderrMode,
    pausable: bool,
    state_tx: watch::Sender<ProcessState>,
}

impl Execute {
    pub fn new(command: CommandVector) -> Self {
        let printable = command.printable();
        debug!("Call command \"{printable}\"");
        let (state_tx, _) = watch::channel(ProcessState::Idle);
        Self {
            command,
            filters: Vec::new(),
            stderr: StderrMode::default(),
            pausable: true,
            state_tx,
        }
    }

    /// Appends a filter; filters run in the order they were added.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(String) -> String + Send + Sync + 'static,
    {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    /// When false, forwarded signals are swallowed instead of reaching the
    /// command.
    pub fn pausable(mut self, pausable: bool) -> Self {
        self.pausable = pausable;
        self
    }

    pub fn command(&self) -> &CommandVector {
        &self.command
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    /// Runs the command without a callback and returns its exit code.
    pub async fn run_silent(&mut self) -> Result<i32, ExecError> {
        self.run(|_, _: &mut ()| {}, &mut ()).await
    }

    /// Runs the command to completion. Every output line that survives the
    /// filters is passed to `on_line` together with `context`.
    ///
    /// Returns the exit code, or the negated signal number if the command
    /// was killed by a signal. A non-zero code is not an error.
    pub async fn run<C, F>(&mut self, mut on_line: F, context: &mut C) -> Result<i32, ExecError>
    where
        F: FnMut(&str, &mut C),
    {
        let printable = self.command.printable();

        let signals = match SignalGuard::arm(self.pausable) {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!("running \"{printable}\" without pause/resume/kill support: {err}");
                None
            }
        };

        debug!("Starting command \"{printable}\"");
        let SpawnedChild {
            mut child,
            pid,
            mut lines_rx,
            readers,
        } = spawn_child(&self.command, self.stderr)?;
        if let Some(signals) = signals.as_ref() {
            signals.attach(pid);
        }
        self.state_tx.send_replace(ProcessState::Running {
            pid,
            forwarding: signals.is_some(),
        });

        let mut exit_status: Option<ExitStatus> = None;
        let mut lines_open = true;
        let mut drain_deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                line = lines_rx.recv(), if lines_open => match line {
                    Some(line) => {
                        if let Some(line) = self.apply_filters(line) {
                            on_line(&line, context);
                        }
                    }
                    None => lines_open = false,
                },
                status = child.wait(), if exit_status.is_none() => {
                    let status = status.map_err(|source| ExecError::Wait {
                        program: self.command.get_program().to_string(),
                        source,
                    })?;
                    exit_status = Some(status);
                    drain_deadline = Some(Instant::now() + OUTPUT_DRAIN_TIMEOUT);
                }
                signal = next_forwarded(signals.as_ref()) => {
                    self.on_forwarded(signal, pid, &printable);
                }
                _ = drain_timer(drain_deadline), if lines_open => {
                    warn!("output of \"{printable}\" still open after exit; giving up on it");
                    let _ = kill_process_group(pid);
                    lines_open = false;
                }
            }
            if exit_status.is_some() && !lines_open {
                break;
            }
        }
        for reader in readers {
            reader.abort();
        }
        drop(signals);

        let exit_code = exit_status.map_or(-1, status_code);
        self.state_tx
            .send_replace(ProcessState::Terminated { exit_code });
        if exit_code == 0 {
            let short: String = printable.chars().take(16).collect();
            debug!("Command \"{short}\" returns {exit_code}");
        } else {
            warn!("Command \"{printable}\" returns {exit_code}");
        }
        Ok(exit_code)
    }

    fn apply_filters(&self, line: String) -> Option<String> {
        let line = self
            .filters
            .iter()
            .fold(line, |line, filter| filter(line));
        (!line.is_empty()).then_some(line)
    }

    fn on_forwarded(&self, signal: ForwardedSignal, pid: u32, printable: &str) {
        match signal {
            ForwardedSignal::Pause => {
                info!("Pause process \"{printable}\"");
                self.state_tx.send_replace(ProcessState::Paused { pid });
            }
            ForwardedSignal::Resume => {
                info!("Resume process \"{printable}\"");
                self.state_tx.send_replace(ProcessState::Running {
                    pid,
                    forwarding: true,
                });
            }
            ForwardedSignal::Kill => {
                info!("Kill process \"{printable}\"");
            }
        }
    }
}

async fn next_forwarded(signals: Option<&SignalGuard>) -> ForwardedSignal {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

async fn drain_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}
