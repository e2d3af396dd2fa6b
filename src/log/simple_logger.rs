use std::io::Write;

#[cfg(feature = "dev")]
use std::{fs::File, path::Path};

use super::{Level, Log};

pub struct SimpleLogger<W: Send + Sync>
where
    for<'a> &'a W: Write,
{
    target: W,
    prefix: &'static str,
}

impl<W: Send + Sync> Log for SimpleLogger<W>
where
    for<'a> &'a W: Write,
{
    fn log(&self, level: Level, args: &std::fmt::Arguments<'_>) {
        let _ = match level {
            Level::Error | Level::Warn | Level::Info => {
                writeln!(&self.target, "{}{}", self.prefix, args)
            }
            Level::Debug | Level::Trace => {
                writeln!(&self.target, "{}[{:?}] {}", self.prefix, level, args)
            }
        };
    }

    fn flush(&self) {
        let _ = (&self.target).flush();
    }
}

impl SimpleLogger<std::io::Stderr> {
    pub fn to_stderr(prefix: &'static str) -> SimpleLogger<std::io::Stderr> {
        SimpleLogger {
            target: std::io::stderr(),
            prefix,
        }
    }
}

#[cfg(feature = "dev")]
impl SimpleLogger<File> {
    pub fn to_file<P: AsRef<Path>>(name: P, prefix: &'static str) -> Result<Self, std::io::Error> {
        let target = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(name)?;
        Ok(Self { target, prefix })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, RwLock},
    };

    use super::super::{Level, Log};
    use super::SimpleLogger;

    #[derive(Clone, Default)]
    struct MyString {
        inner: Arc<RwLock<String>>,
    }

    impl MyString {
        fn read(&self) -> String {
            self.inner.read().unwrap().clone()
        }
    }

    impl io::Write for &'_ MyString {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner
                .write()
                .unwrap()
                .push_str(std::str::from_utf8(buf).unwrap());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.write(b"flushed").map(drop)
        }
    }

    #[test]
    fn test_write_and_flush() {
        let target = MyString::default();
        let logger = SimpleLogger {
            target: target.clone(),
            prefix: "[test] ",
        };

        logger.log(Level::Info, &format_args!("Hello World!"));

        let value = target.read();
        assert_eq!(value, "[test] Hello World!\n");
        drop(value);

        logger.flush();

        let value = target.read();
        assert_eq!(value, "[test] Hello World!\nflushed");
        drop(value);
    }

    #[test]
    fn debug_records_carry_their_level() {
        let target = MyString::default();
        let logger = SimpleLogger {
            target: target.clone(),
            prefix: "fg: ",
        };

        logger.log(Level::Debug, &format_args!("forwarded SIGTERM"));

        assert_eq!(target.read(), "fg: [Debug] forwarded SIGTERM\n");
    }
}
