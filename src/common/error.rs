use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Invalid command line usage.
    Options(String),
    /// Setting up the foreground child failed before it could run.
    Io(Option<String>, std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Options(e) => write!(f, "{e}"),
            Error::Io(location, e) => {
                if let Some(program) = location {
                    write!(f, "cannot run '{program}': {e}")
                } else {
                    write!(f, "IO error: {e}")
                }
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Options(_) => None,
            Error::Io(_, e) => Some(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(None, err)
    }
}

impl Error {
    pub fn io_for(program: &str, err: std::io::Error) -> Self {
        Self::Io(Some(program.to_string()), err)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use pretty_assertions::assert_eq;

    use super::Error;

    #[test]
    fn display() {
        let err = Error::Options("unrecognized option 'x'".to_string());
        assert_eq!(err.to_string(), "unrecognized option 'x'");

        let err = Error::io_for("sleep", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.to_string(), "cannot run 'sleep': permission denied");

        let err: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(err.to_string(), "IO error: permission denied");
    }
}
