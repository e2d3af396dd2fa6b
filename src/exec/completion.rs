use std::{
    fmt,
    io::Write,
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use crate::{
    log::dev_warn,
    system::signal::{signal_name, SignalNumber},
};

/// How the foreground child ended, and therefore how the current process will end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exit with this code.
    Code(i32),
    /// Die from this signal.
    Signal(SignalNumber),
}

impl ExitStatus {
    /// The numeric status of this exit.
    ///
    /// For [`ExitStatus::Signal`] this is the shell convention `128 + signal`, which is what
    /// observers see if the process cannot be killed by the signal itself.
    pub fn code(&self) -> i32 {
        match *self {
            ExitStatus::Code(code) => code,
            ExitStatus::Signal(signal) => 128 + signal,
        }
    }

    pub fn signal(&self) -> Option<SignalNumber> {
        match *self {
            ExitStatus::Code(_) => None,
            ExitStatus::Signal(signal) => Some(signal),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ExitStatus::Code(code) => write!(f, "exit code {code}"),
            ExitStatus::Signal(signal) => write!(f, "{}", signal_name(signal)),
        }
    }
}

/// The hook called once the child has closed.
///
/// It receives a [`Completion`] that can inspect or override the pending exit status. The current
/// process only terminates after [`Completion::proceed`] has been called, either from inside the
/// hook or later from anywhere else.
pub type CloseHandler = Box<dyn FnOnce(Completion)>;

/// The hook used when the caller does not provide one: proceed right away.
pub(crate) fn default_close_handler() -> CloseHandler {
    Box::new(|completion| completion.proceed())
}

struct Shared {
    status: Mutex<ExitStatus>,
    proceeded: AtomicBool,
    waker: UnixStream,
}

/// Access to the pending exit status of the current process once the foreground child closed.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct Completion {
    shared: Arc<Shared>,
}

impl Completion {
    pub(crate) fn new(status: ExitStatus, waker: UnixStream) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(status),
                proceeded: AtomicBool::new(false),
                waker,
            }),
        }
    }

    /// The status the current process will end with.
    pub fn status(&self) -> ExitStatus {
        *self
            .shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Override the status the current process will end with.
    ///
    /// Has no effect once [`Completion::proceed`] has been called.
    pub fn set_status(&self, status: ExitStatus) {
        if self.has_proceeded() {
            return;
        }

        *self
            .shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Numeric form of the pending status, `128 + signal` for signal deaths.
    pub fn exit_code(&self) -> i32 {
        self.status().code()
    }

    /// Let the current process terminate with the pending status.
    ///
    /// Only the first call has an effect.
    pub fn proceed(&self) {
        if self.shared.proceeded.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = (&self.shared.waker).write_all(&[1]) {
            dev_warn!("cannot wake up the event loop: {err}");
        }
    }

    pub fn has_proceeded(&self) -> bool {
        self.shared.proceeded.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("status", &self.status())
            .field("proceeded", &self.has_proceeded())
            .finish()
    }
}
