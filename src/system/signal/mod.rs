//! Utilities to handle signals.
use std::borrow::Cow;

mod handler;
mod info;
mod set;
mod stream;

#[cfg(test)]
pub(crate) use handler::is_streaming;
pub(crate) use handler::{SignalHandler, SignalHandlerBehavior};
pub(crate) use set::SignalSet;
pub(crate) use stream::{register_handlers, SignalStream};

pub type SignalNumber = libc::c_int;

macro_rules! define_consts {
    ($($signal:ident,)*) => {
        pub mod consts {
            pub use libc::{$($signal,)*};
        }

        fn known_name(signal: SignalNumber) -> Option<&'static str> {
            match signal {
                $(consts::$signal => Some(stringify!($signal)),)*
                _ => None,
            }
        }
    };
}

define_consts! {
    SIGABRT,
    SIGALRM,
    SIGHUP,
    SIGINT,
    SIGTERM,
    SIGVTALRM,
    SIGXCPU,
    SIGXFSZ,
    SIGUSR1,
    SIGUSR2,
    SIGTRAP,
    SIGSYS,
    SIGQUIT,
    SIGCHLD,
    SIGPIPE,
    SIGSEGV,
    SIGKILL,
    SIGSTOP,
}

macro_rules! terminating_signals {
    ($($extra:ident,)*) => {
        /// The signals whose default or conventional effect is to end a process.
        ///
        /// `SIGUSR1` is left out as it is commonly used to toggle debuggers and profilers. Aliases
        /// such as `SIGIOT`, `SIGPOLL` and `SIGUNUSED` share their numbers with `SIGABRT`, `SIGIO`
        /// and `SIGSYS` respectively.
        pub const TERMINATING_SIGNALS: &[SignalNumber] = &[
            libc::SIGABRT,
            libc::SIGALRM,
            libc::SIGHUP,
            libc::SIGINT,
            libc::SIGTERM,
            libc::SIGVTALRM,
            libc::SIGXCPU,
            libc::SIGXFSZ,
            libc::SIGUSR2,
            libc::SIGTRAP,
            libc::SIGSYS,
            libc::SIGQUIT,
            $(libc::$extra,)*
        ];
    };
}

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(any(
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "sparc",
        target_arch = "sparc64"
    ))
))]
terminating_signals!(SIGIO, SIGPWR, SIGSTKFLT,);

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "sparc",
        target_arch = "sparc64"
    )
))]
terminating_signals!(SIGIO, SIGPWR,);

#[cfg(not(any(target_os = "linux", target_os = "android")))]
terminating_signals!();

/// Signals whose action cannot be changed.
pub(crate) const FORBIDDEN: &[SignalNumber] = &[libc::SIGKILL, libc::SIGSTOP];

pub fn signal_name(signal: SignalNumber) -> Cow<'static, str> {
    match known_name(signal) {
        Some(name) => name.into(),
        None => match signal {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            libc::SIGIO => "SIGIO".into(),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            libc::SIGPWR => "SIGPWR".into(),
            #[cfg(all(
                any(target_os = "linux", target_os = "android"),
                not(any(
                    target_arch = "mips",
                    target_arch = "mips64",
                    target_arch = "sparc",
                    target_arch = "sparc64"
                ))
            ))]
            libc::SIGSTKFLT => "SIGSTKFLT".into(),
            _ => format!("unknown signal #{}", signal).into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{consts::*, signal_name, FORBIDDEN, TERMINATING_SIGNALS};

    #[test]
    fn terminating_signals_are_unique() {
        let unique: BTreeSet<_> = TERMINATING_SIGNALS.iter().collect();
        assert_eq!(unique.len(), TERMINATING_SIGNALS.len());
    }

    #[test]
    fn terminating_signals_exclude_uncatchable_and_usr1() {
        for signal in FORBIDDEN.iter().chain([&SIGUSR1, &SIGCHLD]) {
            assert!(!TERMINATING_SIGNALS.contains(signal));
        }
        for signal in [SIGHUP, SIGINT, SIGTERM, SIGQUIT, SIGUSR2] {
            assert!(TERMINATING_SIGNALS.contains(&signal));
        }
    }

    #[test]
    fn names() {
        assert_eq!(signal_name(SIGTERM), "SIGTERM");
        assert_eq!(signal_name(SIGHUP), "SIGHUP");
        assert_eq!(signal_name(1000), "unknown signal #1000");
        #[cfg(target_os = "linux")]
        assert_eq!(signal_name(libc::SIGPWR), "SIGPWR");
    }

    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[test]
    fn linux_set_matches_signal_exit() {
        let expected = [
            SIGABRT,
            SIGALRM,
            SIGHUP,
            SIGINT,
            SIGTERM,
            SIGVTALRM,
            SIGXCPU,
            SIGXFSZ,
            SIGUSR2,
            SIGTRAP,
            SIGSYS,
            SIGQUIT,
            libc::SIGIO,
            libc::SIGPWR,
            libc::SIGSTKFLT,
        ];
        let unique: BTreeSet<_> = TERMINATING_SIGNALS.iter().copied().collect();
        assert_eq!(unique, expected.into_iter().collect::<BTreeSet<_>>());
        assert_eq!(signal_name(libc::SIGSTKFLT), "SIGSTKFLT");
    }
}
