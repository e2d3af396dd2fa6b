use std::{io, os::fd::RawFd};

use crate::cutils::cerr;
use interface::ProcessId;

use self::signal::SignalNumber;

// generalized traits for when we want to hide implementations
pub mod interface;

pub mod poll;

pub mod signal;

pub mod wait;

/// Send a signal to a process with the specified ID.
pub fn kill(pid: ProcessId, signal: SignalNumber) -> io::Result<()> {
    // SAFETY: This function cannot cause UB even if `pid` is not a valid process ID or if
    // `signal` is not a valid signal code.
    cerr(unsafe { libc::kill(pid.get(), signal) }).map(|_| ())
}

/// Get the process ID of the current process.
pub fn getpid() -> ProcessId {
    ProcessId::new(unsafe { libc::getpid() })
}

/// Duplicate `fd` onto `target`, closing whatever `target` referred to.
///
/// The duplicate does not have the close-on-exec flag set.
pub(crate) fn dup2(fd: RawFd, target: RawFd) -> io::Result<()> {
    // SAFETY: `dup2` cannot cause UB even if `fd` is not a valid descriptor.
    cerr(unsafe { libc::dup2(fd, target) }).map(|_| ())
}

#[cfg(test)]
pub(crate) enum ForkResult {
    // Parent process branch with the child process' PID.
    Parent(ProcessId),
    // Child process branch.
    Child,
}

/// Create a new process.
///
/// # Safety
///
/// In a multithreaded program, only async-signal-safe functions are guaranteed to work in the
/// child process until a call to `execve` or a similar function is done.
#[cfg(test)]
pub(crate) unsafe fn fork() -> io::Result<ForkResult> {
    let pid = cerr(unsafe { libc::fork() })?;
    if pid == 0 {
        Ok(ForkResult::Child)
    } else {
        Ok(ForkResult::Parent(ProcessId::new(pid)))
    }
}

pub fn make_zeroed_sigaction() -> libc::sigaction {
    // SAFETY: `sigaction` is a C struct, all-zeroes is a valid representation. Its exact layout
    // differs between platforms so it cannot be built with a struct literal.
    unsafe { std::mem::zeroed() }
}
