use std::{
    io,
    sync::{
        atomic::{AtomicI32, Ordering},
        Once,
    },
};

use crate::{
    log::{dev_debug, dev_warn},
    system::{interface::ProcessId, kill, signal::consts::SIGHUP},
};

/// PID of the child that must be hung up if the current process exits, zero if none.
static HANGUP_TARGET: AtomicI32 = AtomicI32::new(0);
static REGISTER: Once = Once::new();

extern "C" fn hangup_on_exit() {
    let pid = HANGUP_TARGET.swap(0, Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: `kill` cannot cause UB.
        #[allow(unsafe_code)]
        let _ = unsafe { libc::kill(pid, SIGHUP) };
    }
}

/// Sends `SIGHUP` to the child if the current process exits, or if this value is dropped, while
/// the hook is still armed.
pub(super) struct ExitHook {
    child_pid: ProcessId,
}

impl ExitHook {
    pub(super) fn arm(child_pid: ProcessId) -> io::Result<Self> {
        let mut registered = Ok(());
        REGISTER.call_once(|| {
            // SAFETY: `hangup_on_exit` is an `extern "C"` function without arguments that only
            // performs async-signal-safe operations.
            #[allow(unsafe_code)]
            let result = unsafe { libc::atexit(hangup_on_exit) };
            if result != 0 {
                registered = Err(io::Error::new(
                    io::ErrorKind::Other,
                    "cannot register exit handler",
                ));
            }
        });
        registered?;

        HANGUP_TARGET.store(child_pid.get(), Ordering::SeqCst);
        dev_debug!("{child_pid} will be hung up if this process exits");

        Ok(Self { child_pid })
    }

    /// Stop watching for the exit of the current process. Returns `false` if the hook was not
    /// armed anymore.
    pub(super) fn disarm(&mut self) -> bool {
        HANGUP_TARGET
            .compare_exchange(self.child_pid.get(), 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[cfg(test)]
    pub(super) fn is_armed(&self) -> bool {
        HANGUP_TARGET.load(Ordering::SeqCst) == self.child_pid.get()
    }
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        if self.disarm() {
            dev_debug!("abandoning {}, sending SIGHUP", self.child_pid);
            if let Err(err) = kill(self.child_pid, SIGHUP) {
                dev_warn!("cannot send SIGHUP to {}: {err}", self.child_pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        os::{fd::OwnedFd, unix::net::UnixStream},
        process::{Command, Stdio},
        time::Duration,
    };

    use super::ExitHook;
    use crate::{
        exec::tests::{fork_and_wait, in_forked_process},
        system::{
            interface::ProcessId,
            signal::consts::*,
            wait::{Wait, WaitOptions},
        },
    };

    #[test]
    fn disarmed_hook_leaves_child_alone() {
        in_forked_process(|| {
            let child = Command::new("sleep").arg("5").spawn().unwrap();
            let child_pid = ProcessId::from(child.id());

            let mut hook = ExitHook::arm(child_pid).unwrap();
            assert!(hook.is_armed());
            assert!(hook.disarm());
            assert!(!hook.disarm());
            drop(hook);

            assert!(child_pid.wait(WaitOptions::new().no_hang()).is_err());
            crate::system::kill(child_pid, SIGKILL).unwrap();
        });
    }

    #[test]
    fn dropping_an_armed_hook_hangs_up() {
        in_forked_process(|| {
            let child = Command::new("sleep").arg("5").spawn().unwrap();
            let child_pid = ProcessId::from(child.id());

            drop(ExitHook::arm(child_pid).unwrap());

            let (_, status) = child_pid.wait(WaitOptions::new()).unwrap();
            assert_eq!(status.term_signal(), Some(SIGHUP));
        });
    }

    #[test]
    fn exiting_hangs_up_the_child() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let status = fork_and_wait(|| {
            let child = Command::new("sh")
                .args([
                    "-c",
                    "trap 'printf H; exit 0' HUP; printf R; while :; do sleep 0.1; done",
                ])
                .stdout(Stdio::from(OwnedFd::from(theirs)))
                .spawn()
                .unwrap();

            let mut ready = [0u8; 1];
            (&ours).read_exact(&mut ready).unwrap();
            assert_eq!(&ready, b"R");

            std::mem::forget(ExitHook::arm(ProcessId::from(child.id())).unwrap());
            std::process::exit(3);
        });
        assert_eq!(status.exit_status(), Some(3));

        ours.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut hangup = [0u8; 1];
        (&ours).read_exact(&mut hangup).unwrap();
        assert_eq!(&hangup, b"H");
    }
}
