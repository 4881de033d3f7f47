// https://github.com/vorner/signal-hook/blob/master/signal-hook/src/iterator/mod.rs

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use libc::{c_int, pid_t};
use signal_hook::consts::SIGINT;
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Error)]
pub enum SigError {
    #[error("{}", strerror(.0))]
    Syscall(c_int),

    #[error("refusing to signal {0}")]
    InvalidTarget(Target),
}

fn strerror(errno: &c_int) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

impl SigError {
    fn last_os_error() -> Self {
        SigError::Syscall(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    fn as_raw(self) -> c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
        }
    }
}

/// Receiver of a signal: one process or every member of a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Process(pid_t),
    Group(pid_t),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Process(pid) => write!(f, "process {}", pid),
            Target::Group(pgid) => write!(f, "process group {}", pgid),
        }
    }
}

pub(crate) fn deliver(target: Target, signal: Signal) -> Result<(), SigError> {
    // kill(2) treats 0, -1 and negative ids as broadcast addresses
    let raw_pid = match target {
        Target::Process(pid) if pid > 0 => pid,
        Target::Group(pgid) if pgid > 1 => -pgid,
        _ => return Err(SigError::InvalidTarget(target)),
    };

    match unsafe { libc::kill(raw_pid, signal.as_raw()) } {
        -1 => Err(SigError::last_os_error()),
        _ => Ok(()),
    }
}

/// Cooperative cancellation flag handed to builtin stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct RunningState {
    cancel: Option<CancelToken>,
    pgid: Option<pid_t>,
}

/// The single-slot record of the active pipeline, shared between the command
/// loop and the signal coordinator.
#[derive(Debug, Clone, Default)]
pub struct Foreground {
    state: Arc<Mutex<RunningState>>,
}

impl Foreground {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunningState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a pipeline as active. The state is cleared when the guard drops.
    pub fn begin(&self, cancel: CancelToken) -> ForegroundGuard<'_> {
        *self.lock() = RunningState {
            cancel: Some(cancel),
            pgid: None,
        };
        ForegroundGuard { foreground: self }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.cancel.is_none() && state.pgid.is_none()
    }

    pub fn group(&self) -> Option<pid_t> {
        self.lock().pgid
    }

    /// Forwards an interrupt to the active pipeline, if any.
    ///
    /// The lock is held for the whole delivery so the pipeline cannot be
    /// cleared and replaced halfway through.
    pub fn interrupt(&self) -> Result<(), SigError> {
        let state = self.lock();

        let delivered = match state.pgid {
            Some(pgid) => {
                debug!(pgid, "forwarding interrupt to process group");
                deliver(Target::Group(pgid), Signal::Interrupt)
            }
            None => Ok(()),
        };

        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }

        delivered
    }
}

pub struct ForegroundGuard<'a> {
    foreground: &'a Foreground,
}

impl ForegroundGuard<'_> {
    pub fn set_group(&self, pgid: pid_t) {
        self.foreground.lock().pgid = Some(pgid);
    }

    /// Repeats an interrupt that arrived while stages were still joining the
    /// group, so late members receive it too.
    pub fn forward_pending_interrupt(&self) -> Result<(), SigError> {
        let state = self.foreground.lock();
        let interrupted = state
            .cancel
            .as_ref()
            .map_or(false, CancelToken::is_cancelled);

        match state.pgid {
            Some(pgid) if interrupted => deliver(Target::Group(pgid), Signal::Interrupt),
            _ => Ok(()),
        }
    }
}

impl Drop for ForegroundGuard<'_> {
    fn drop(&mut self) {
        *self.foreground.lock() = RunningState::default();
    }
}

/// Registers for SIGINT and forwards every delivery to `foreground` on a
/// dedicated thread for the rest of the program's life.
pub(crate) fn spawn_coordinator(foreground: Foreground) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::new(&[SIGINT])?;

    thread::Builder::new()
        .name("signal-coordinator".into())
        .spawn(move || {
            for sig in signals.forever() {
                debug!(sig, "signal received");
                if let Err(e) = foreground.interrupt() {
                    warn!("cannot forward interrupt: {}", e);
                }
            }
        })
}
