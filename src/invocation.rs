//! Turning the loosely shaped call surface of [`crate::foreground_child`] into a program, its
//! arguments and a close handler.
use std::fmt;

use crate::exec::{default_close_handler, CloseHandler, Completion};

/// One positional argument of a call.
pub enum CallArg {
    Str(String),
    List(Vec<String>),
    Hook(CloseHandler),
}

impl CallArg {
    pub fn hook(hook: impl FnOnce(Completion) + 'static) -> Self {
        CallArg::Hook(Box::new(hook))
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            CallArg::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for CallArg {
    fn from(value: &str) -> Self {
        CallArg::Str(value.to_string())
    }
}

impl From<String> for CallArg {
    fn from(value: String) -> Self {
        CallArg::Str(value)
    }
}

impl From<Vec<String>> for CallArg {
    fn from(value: Vec<String>) -> Self {
        CallArg::List(value)
    }
}

impl From<&[&str]> for CallArg {
    fn from(value: &[&str]) -> Self {
        CallArg::List(value.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for CallArg {
    fn from(value: [&str; N]) -> Self {
        CallArg::List(value.iter().map(|s| s.to_string()).collect())
    }
}

impl fmt::Debug for CallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallArg::Str(s) => f.debug_tuple("Str").field(s).finish(),
            CallArg::List(l) => f.debug_tuple("List").field(l).finish(),
            CallArg::Hook(_) => f.write_str("Hook(..)"),
        }
    }
}

/// What to run in the foreground and what to do once it closes.
pub struct Invocation {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) hook: CloseHandler,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            hook: default_close_handler(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the close handler. The default one proceeds right away.
    pub fn on_close(mut self, hook: impl FnOnce(Completion) + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Normalize the positional arguments of a call.
    ///
    /// - A trailing [`CallArg::Hook`] is the close handler.
    /// - If the first argument is a list, it is `[program, args...]` and nothing else counts.
    /// - Otherwise the first argument is the program and either the second argument is the list
    ///   of arguments, or every string after the program is an argument.
    ///
    /// Nothing is validated: a missing program becomes an empty one and fails to spawn later.
    pub fn normalize(mut call: Vec<CallArg>) -> Self {
        let hook = match call.last() {
            Some(CallArg::Hook(_)) => match call.pop() {
                Some(CallArg::Hook(hook)) => hook,
                _ => default_close_handler(),
            },
            _ => default_close_handler(),
        };

        let mut call = call.into_iter();
        let (program, args) = match call.next() {
            Some(CallArg::List(list)) => {
                let mut list = list.into_iter();
                (list.next().unwrap_or_default(), list.collect())
            }
            Some(CallArg::Str(program)) => {
                let rest: Vec<CallArg> = call.collect();
                let args = match rest.first() {
                    Some(CallArg::List(args)) => args.clone(),
                    _ => rest
                        .iter()
                        .filter_map(CallArg::as_str)
                        .map(str::to_string)
                        .collect(),
                };
                (program, args)
            }
            Some(CallArg::Hook(_)) | None => (String::new(), Vec::new()),
        };

        Self {
            program,
            args,
            hook,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}
