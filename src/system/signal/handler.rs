use std::io;

use crate::log::dev_warn;

use super::{set::SignalAction, signal_name, SignalNumber, FORBIDDEN};

/// A handler for a signal.
///
/// When a value of this type is dropped, it will try to restore the action that was registered for
/// the signal prior to calling [`SignalHandler::register`].
pub(crate) struct SignalHandler {
    signal: SignalNumber,
    original_action: SignalAction,
}

impl SignalHandler {
    /// Register a new handler for the given signal with the provided behavior.
    pub(crate) fn register(
        signal: SignalNumber,
        behavior: SignalHandlerBehavior,
    ) -> io::Result<Self> {
        if FORBIDDEN.contains(&signal) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("the {} signal action cannot be overriden", signal_name(signal)),
            ));
        }

        let action = SignalAction::new(behavior)?;
        let original_action = action.register(signal)?;

        Ok(Self {
            signal,
            original_action,
        })
    }

    /// The signal this handler was registered for.
    pub(crate) fn signal(&self) -> SignalNumber {
        self.signal
    }

    /// Forget this signal handler.
    ///
    /// This can be used to avoid restoring the original action for the signal.
    pub(crate) fn forget(self) {
        std::mem::forget(self)
    }
}

impl Drop for SignalHandler {
    #[track_caller]
    fn drop(&mut self) {
        let signal = self.signal;
        if let Err(err) = self.original_action.register(signal) {
            dev_warn!(
                "cannot restore original action for {}: {err}",
                signal_name(signal),
            )
        }
    }
}

/// The possible behaviors for a [`SignalHandler`].
pub(crate) enum SignalHandlerBehavior {
    /// Execute the default action for the signal.
    Default,
    /// Stream the signal information into the [`super::SignalStream`].
    Stream,
}

/// Check whether the current action for `signal` streams into the [`super::SignalStream`].
#[cfg(test)]
pub(crate) fn is_streaming(signal: SignalNumber) -> io::Result<bool> {
    Ok(SignalAction::current(signal)?.is_stream())
}
