//! Run a program as the foreground child of the current process.
//!
//! The child inherits the standard streams, every terminating signal received by the current
//! process is relayed to it and, once it closes, the current process ends the same way: with the
//! same exit code or killed by the same signal. A close handler can inspect and override that
//! status, and decide when the current process may end.
//!
//! ```no_run
//! use foreground_child::{launch, ExitStatus, Invocation};
//!
//! let invocation = Invocation::new("make").arg("test").on_close(|completion| {
//!     if completion.status() == ExitStatus::Code(2) {
//!         completion.set_status(ExitStatus::Code(0));
//!     }
//!     completion.proceed();
//! });
//!
//! launch(invocation)?.run()
//! # ; Ok::<(), std::io::Error>(())
//! ```
#[macro_use]
mod macros;
pub(crate) mod channel;
pub(crate) mod common;
pub(crate) mod cutils;
pub(crate) mod exec;
pub(crate) mod invocation;
pub(crate) mod log;
pub(crate) mod system;

mod foreground;

pub use crate::channel::{Channel, Message, CHANNEL_FD_VAR, MAX_MESSAGE_LEN};
pub use crate::common::Error;
pub use crate::exec::{
    foreground_child, launch, CloseHandler, Completion, ExitStatus, ForegroundChild,
};
pub use crate::foreground::main;
pub use crate::invocation::{CallArg, Invocation};
pub use crate::log::ForegroundLogger;
pub use crate::system::interface::ProcessId;
pub use crate::system::signal::{consts, signal_name, SignalNumber, TERMINATING_SIGNALS};
