use std::{collections::BTreeMap, io};

use crate::{
    log::{dev_debug, dev_warn},
    system::{
        interface::ProcessId,
        kill,
        signal::{register_handlers, signal_name, SignalHandler, SignalNumber, TERMINATING_SIGNALS},
    },
};

/// Forwards every terminating signal received by the current process to the child.
///
/// The listener set is built in a single pass from [`TERMINATING_SIGNALS`], so installing and
/// uninstalling always touch the same signals.
pub(super) struct SignalRelay {
    child_pid: ProcessId,
    listeners: BTreeMap<SignalNumber, SignalHandler>,
}

impl SignalRelay {
    pub(super) fn install(child_pid: ProcessId) -> io::Result<Self> {
        let listeners = register_handlers(TERMINATING_SIGNALS.iter().copied())?
            .into_iter()
            .map(|handler| (handler.signal(), handler))
            .collect();

        dev_debug!("relaying terminating signals to {child_pid}");

        Ok(Self {
            child_pid,
            listeners,
        })
    }

    /// Whether `signal` is currently being relayed.
    pub(super) fn relays(&self, signal: SignalNumber) -> bool {
        self.listeners.contains_key(&signal)
    }

    /// Send `signal` to the child if it is being relayed. Returns whether the signal was sent.
    pub(super) fn forward(&self, signal: SignalNumber) -> bool {
        if !self.relays(signal) {
            return false;
        }

        match kill(self.child_pid, signal) {
            Ok(()) => {
                dev_debug!("forwarded {} to {}", signal_name(signal), self.child_pid);
                true
            }
            Err(err) => {
                dev_warn!(
                    "cannot forward {} to {}: {err}",
                    signal_name(signal),
                    self.child_pid
                );
                false
            }
        }
    }

    /// Restore the original action of every relayed signal.
    ///
    /// Calling this more than once is a no-op.
    pub(super) fn uninstall(&mut self) {
        for (signal, handler) in std::mem::take(&mut self.listeners) {
            dev_debug!("no longer relaying {}", signal_name(signal));
            drop(handler);
        }
    }

    #[cfg(test)]
    pub(super) fn is_installed(&self) -> bool {
        !self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{process::Command, time::Duration};

    use super::SignalRelay;
    use crate::{
        exec::tests::in_forked_process,
        system::{
            getpid,
            interface::ProcessId,
            kill,
            signal::{consts::*, is_streaming, SignalStream, TERMINATING_SIGNALS},
            wait::{Wait, WaitOptions},
        },
    };

    #[test]
    fn forwards_the_same_signal() {
        in_forked_process(|| {
            let child = Command::new("sleep").arg("5").spawn().unwrap();
            let child_pid = ProcessId::from(child.id());
            let relay = SignalRelay::install(child_pid).unwrap();

            kill(getpid(), SIGTERM).unwrap();
            let info = SignalStream::get().unwrap().recv().unwrap();
            assert_eq!(info.signal(), SIGTERM);
            assert!(relay.forward(info.signal()));

            let (_, status) = child_pid.wait(WaitOptions::new()).unwrap();
            assert_eq!(status.term_signal(), Some(SIGTERM));
        });
    }

    #[test]
    fn does_not_forward_unrelayed_signals() {
        in_forked_process(|| {
            let child = Command::new("sleep").arg("5").spawn().unwrap();
            let child_pid = ProcessId::from(child.id());
            let relay = SignalRelay::install(child_pid).unwrap();

            assert!(!relay.relays(SIGUSR1));
            assert!(!relay.relays(SIGCHLD));
            assert!(!relay.forward(SIGUSR1));

            std::thread::sleep(Duration::from_millis(50));
            assert!(child_pid.wait(WaitOptions::new().no_hang()).is_err());

            kill(child_pid, SIGKILL).unwrap();
        });
    }

    #[test]
    fn uninstall_restores_every_listener() {
        in_forked_process(|| {
            for &signal in TERMINATING_SIGNALS {
                assert!(!is_streaming(signal).unwrap());
            }

            let mut relay = SignalRelay::install(ProcessId::new(i32::MAX)).unwrap();
            assert!(relay.is_installed());
            for &signal in TERMINATING_SIGNALS {
                assert!(relay.relays(signal));
                assert!(is_streaming(signal).unwrap());
            }

            relay.uninstall();
            relay.uninstall();

            assert!(!relay.is_installed());
            for &signal in TERMINATING_SIGNALS {
                assert!(!relay.relays(signal));
                assert!(!is_streaming(signal).unwrap());
            }
        });
    }
}
