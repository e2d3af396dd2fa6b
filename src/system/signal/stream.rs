use std::{
    io,
    mem::MaybeUninit,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
    sync::OnceLock,
};

use crate::{cutils::cerr, log::dev_error};

use super::{
    handler::{SignalHandler, SignalHandlerBehavior},
    info::SignalInfo,
    signal_name, SignalNumber,
};

static STREAM: OnceLock<Result<SignalStream, io::ErrorKind>> = OnceLock::new();

pub(super) extern "C" fn send_siginfo(
    _signal: SignalNumber,
    info: *const SignalInfo,
    _context: *const libc::c_void,
) {
    if let Some(Ok(stream)) = STREAM.get() {
        let tx = stream.tx.as_raw_fd();
        unsafe { libc::send(tx, info.cast(), SignalInfo::SIZE, libc::MSG_DONTWAIT) };
    }
}

/// A type able to receive signal information from any [`super::SignalHandler`] with the
/// [`super::SignalHandlerBehavior::Stream`] behavior.
///
/// This is a singleton type. Meaning that there will be only one value of this type during the
/// execution of a program.
pub(crate) struct SignalStream {
    rx: UnixStream,
    tx: UnixStream,
}

impl SignalStream {
    /// Get the [`SignalStream`], creating it on first use.
    pub(crate) fn get() -> io::Result<&'static Self> {
        STREAM
            .get_or_init(|| {
                let (rx, tx) = UnixStream::pair().map_err(|err| {
                    dev_error!("cannot create socket pair for `SignalStream`: {err}");
                    err.kind()
                })?;
                Ok(Self { rx, tx })
            })
            .as_ref()
            .map_err(|&kind| io::Error::from(kind))
    }

    /// Receives the information related to the arrival of a signal.
    pub(crate) fn recv(&self) -> io::Result<SignalInfo> {
        let mut info = MaybeUninit::<SignalInfo>::uninit();
        let fd = self.rx.as_raw_fd();
        let bytes = cerr(unsafe { libc::recv(fd, info.as_mut_ptr().cast(), SignalInfo::SIZE, 0) })?;

        if bytes as usize != SignalInfo::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough bytes when receiving `siginfo_t`",
            ));
        }
        // SAFETY: we can assume `info` is initialized because `recv` wrote enough bytes to fill
        // the value and `siginfo_t` is POD.
        Ok(unsafe { info.assume_init() })
    }
}

/// Register a streaming handler for every signal in `signals`.
///
/// If any registration fails, the handlers registered so far are dropped, restoring their
/// original actions.
pub(crate) fn register_handlers(
    signals: impl IntoIterator<Item = SignalNumber>,
) -> io::Result<Vec<SignalHandler>> {
    // The stream must exist before any handler can write into it.
    SignalStream::get()?;

    signals
        .into_iter()
        .map(|signal| {
            SignalHandler::register(signal, SignalHandlerBehavior::Stream).map_err(|err| {
                let name = signal_name(signal);
                dev_error!("cannot setup handler for {name}: {err}");
                err
            })
        })
        .collect()
}

impl AsRawFd for SignalStream {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}
