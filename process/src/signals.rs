//! Process-wide dispatcher for forwarded job-control signals.
//!
//! Signal dispositions are global to the process, so at most one running
//! command is "armed" at a time. Arming installs handlers for `SIGTSTP`,
//! `SIGCONT` and `SIGHUP`; the returned [`SignalGuard`] restores the previous
//! dispositions when dropped, whichever way the run ends.
//!
//! The handler itself only touches atomics and calls `killpg(2)` and
//! `write(2)`, both async-signal-safe. Every forwarded signal is also written
//! as one byte to a self-pipe so the async side can log it and track the
//! paused state.

use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::errors::SignalSetupError;

const FORWARDED_SIGNALS: [libc::c_int; 3] = [libc::SIGTSTP, libc::SIGCONT, libc::SIGHUP];

/// 0: nobody armed. -1: armed, child not spawned yet. >0: child process group.
static ARMED_PGID: AtomicI32 = AtomicI32::new(0);
static PAUSABLE: AtomicBool = AtomicBool::new(false);
static NOTIFY_PIPE: OnceLock<Option<NotifyPipe>> = OnceLock::new();

const RESERVED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForwardedSignal {
    Pause,
    Resume,
    Kill,
}

impl ForwardedSignal {
    fn from_signum(signum: libc::c_int) -> Option<Self> {
        match signum {
            libc::SIGTSTP => Some(Self::Pause),
            libc::SIGCONT => Some(Self::Resume),
            libc::SIGHUP => Some(Self::Kill),
            _ => None,
        }
    }
}

/// Never closed once created, so the handler can never write into a
/// descriptor number that has been reused.
struct NotifyPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

fn notify_pipe() -> Option<&'static NotifyPipe> {
    NOTIFY_PIPE
        .get_or_init(|| match create_nonblocking_pipe() {
            Ok(pipe) => Some(pipe),
            Err(err) => {
                tracing::warn!("failed to create signal notification pipe: {err}");
                None
            }
        })
        .as_ref()
}

fn create_nonblocking_pipe() -> io::Result<NotifyPipe> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        let fd_flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1
            || fd_flags == -1
            || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
            || unsafe { libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) } == -1
        {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok(NotifyPipe {
        read_fd: fds[0],
        write_fd: fds[1],
    })
}

extern "C" fn forward_signal(signum: libc::c_int) {
    let saved_errno = errno();

    let pgid = ARMED_PGID.load(Ordering::SeqCst);
    if pgid > 0 && PAUSABLE.load(Ordering::SeqCst) {
        let forwarded = match signum {
            libc::SIGTSTP => Some(libc::SIGSTOP),
            libc::SIGCONT => Some(libc::SIGCONT),
            libc::SIGHUP => Some(libc::SIGKILL),
            _ => None,
        };
        if let Some(forwarded) = forwarded {
            unsafe {
                libc::killpg(pgid, forwarded);
            }
            if let Some(Some(pipe)) = NOTIFY_PIPE.get() {
                let byte = signum as u8;
                unsafe {
                    libc::write(pipe.write_fd, (&byte as *const u8).cast(), 1);
                }
            }
        }
    }

    set_errno(saved_errno);
}

#[cfg(target_os = "linux")]
fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

#[cfg(target_os = "linux")]
fn set_errno(value: libc::c_int) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn errno() -> libc::c_int {
    unsafe { *libc::__error() }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn set_errno(value: libc::c_int) {
    unsafe {
        *libc::__error() = value;
    }
}

struct PipeReader(RawFd);

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Holds the process-wide signal dispositions for one run.
pub(crate) struct SignalGuard {
    previous: Vec<(libc::c_int, libc::sigaction)>,
    notifications: Option<AsyncFd<PipeReader>>,
}

impl SignalGuard {
    /// Installs the forwarding handlers. Must be called before the child is
    /// spawned; signals that arrive before [`SignalGuard::attach`] are
    /// swallowed rather than stopping this process.
    pub(crate) fn arm(pausable: bool) -> Result<Self, SignalSetupError> {
        if ARMED_PGID
            .compare_exchange(0, RESERVED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SignalSetupError::AlreadyArmed);
        }
        PAUSABLE.store(pausable, Ordering::SeqCst);

        let notifications = notify_pipe().and_then(|pipe| {
            drain_pipe(pipe.read_fd);
            AsyncFd::with_interest(PipeReader(pipe.read_fd), Interest::READABLE)
                .inspect_err(|err| {
                    tracing::warn!("failed to watch signal notification pipe: {err}");
                })
                .ok()
        });

        let mut guard = Self {
            previous: Vec::with_capacity(FORWARDED_SIGNALS.len()),
            notifications,
        };
        for signal in FORWARDED_SIGNALS {
            let previous = install_handler(signal)
                .map_err(|source| SignalSetupError::Install { signal, source })?;
            guard.previous.push((signal, previous));
        }
        Ok(guard)
    }

    /// Publishes the child's process group as the forwarding target.
    pub(crate) fn attach(&self, process_group_id: u32) {
        ARMED_PGID.store(process_group_id as i32, Ordering::SeqCst);
    }

    /// Resolves with the next signal the handler forwarded. Pending forever
    /// when notifications are unavailable.
    pub(crate) async fn recv(&self) -> ForwardedSignal {
        let Some(notifications) = self.notifications.as_ref() else {
            return std::future::pending().await;
        };
        loop {
            let Ok(mut ready) = notifications.readable().await else {
                return std::future::pending().await;
            };
            let mut byte = 0u8;
            match ready.try_io(|inner| read_byte(inner.get_ref().0, &mut byte)) {
                Ok(Ok(true)) => {
                    if let Some(signal) = ForwardedSignal::from_signum(libc::c_int::from(byte)) {
                        return signal;
                    }
                }
                Ok(Ok(false)) | Ok(Err(_)) => return std::future::pending().await,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        // Deregister before another run can arm and register the same fd.
        drop(self.notifications.take());
        for (signal, previous) in self.previous.drain(..) {
            if unsafe { libc::sigaction(signal, &previous, std::ptr::null_mut()) } == -1 {
                tracing::warn!(
                    "failed to restore handler for signal {signal}: {}",
                    io::Error::last_os_error()
                );
            }
        }
        PAUSABLE.store(false, Ordering::SeqCst);
        ARMED_PGID.store(0, Ordering::SeqCst);
    }
}

fn install_handler(signal: libc::c_int) -> io::Result<libc::sigaction> {
    let handler: extern "C" fn(libc::c_int) = forward_signal;
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(signal, &action, &mut previous) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(previous)
}

fn read_byte(fd: RawFd, byte: &mut u8) -> io::Result<bool> {
    let n = unsafe { libc::read(fd, (byte as *mut u8).cast(), 1) };
    match n {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(false),
        _ => Ok(true),
    }
}

fn drain_pipe(fd: RawFd) {
    let mut byte = 0u8;
    while matches!(read_byte(fd, &mut byte), Ok(true)) {}
}
