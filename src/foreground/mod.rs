#![forbid(unsafe_code)]

mod cli;
mod help;

use crate::{
    common::Error,
    exec::launch,
    invocation::Invocation,
    log::{dev_info, ForegroundLogger},
};

use self::{
    cli::{ForegroundAction, ForegroundOptions},
    help::{long_help_message, USAGE_MSG},
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn main() {
    ForegroundLogger::new("foreground: ").into_global_logger();

    let options = match ForegroundOptions::from_env() {
        Ok(options) => options,
        Err(error) => {
            eprintln_ignore_io_error!("foreground: {error}\n{USAGE_MSG}");
            std::process::exit(1);
        }
    };

    match options.action {
        ForegroundAction::Help => {
            println_ignore_io_error!("{}", long_help_message());
            std::process::exit(0);
        }
        ForegroundAction::Version => {
            println_ignore_io_error!("foreground version {VERSION}");
            std::process::exit(0);
        }
        ForegroundAction::Run => {}
    }

    if let Err(error) = run(options) {
        eprintln_ignore_io_error!("foreground: {error}");
        std::process::exit(1);
    }
}

fn run(options: ForegroundOptions) -> Result<(), Error> {
    let program = options.program.unwrap_or_default();
    dev_info!("running '{program}' with {:?}", options.arguments);

    let invocation = Invocation::new(program.as_str()).args(options.arguments);
    let child = launch(invocation).map_err(|err| Error::io_for(&program, err))?;
    child.run()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::cli::{ForegroundAction, ForegroundOptions};

    fn parse(args: &[&str]) -> Result<ForegroundOptions, String> {
        ForegroundOptions::parse_arguments(
            std::iter::once("foreground")
                .chain(args.iter().copied())
                .map(str::to_string)
                .collect(),
        )
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn program_and_arguments() {
        let options = parse(&["sleep", "1"]).unwrap();
        assert_eq!(options.action, ForegroundAction::Run);
        assert_eq!(options.program.as_deref(), Some("sleep"));
        assert_eq!(options.arguments, strings(&["1"]));
    }

    #[test]
    fn options_stop_at_the_program() {
        let options = parse(&["ls", "-h", "--version"]).unwrap();
        assert_eq!(options.action, ForegroundAction::Run);
        assert_eq!(options.program.as_deref(), Some("ls"));
        assert_eq!(options.arguments, strings(&["-h", "--version"]));
    }

    #[test]
    fn double_dash() {
        let options = parse(&["--", "-weird-name", "-x"]).unwrap();
        assert_eq!(options.program.as_deref(), Some("-weird-name"));
        assert_eq!(options.arguments, strings(&["-x"]));

        assert_eq!(parse(&["--"]), Err("no program given".to_string()));
    }

    #[test]
    fn help_and_version() {
        assert_eq!(parse(&["-h"]).unwrap().action, ForegroundAction::Help);
        assert_eq!(parse(&["--help"]).unwrap().action, ForegroundAction::Help);
        assert_eq!(parse(&["-V"]).unwrap().action, ForegroundAction::Version);
        assert_eq!(parse(&["--version"]).unwrap().action, ForegroundAction::Version);
        assert_eq!(parse(&["-hV"]).unwrap().action, ForegroundAction::Version);
    }

    #[test]
    fn usage_errors() {
        assert_eq!(parse(&[]), Err("no program given".to_string()));
        assert_eq!(parse(&["-x"]), Err("invalid option -- 'x'".to_string()));
        assert_eq!(
            parse(&["--verbose"]),
            Err("unrecognized option '--verbose'".to_string())
        );
        assert_eq!(
            parse(&["--help=yes"]),
            Err("'--help' does not take any arguments".to_string())
        );
    }

    #[test]
    fn lone_dash_is_a_program() {
        let options = parse(&["-"]).unwrap();
        assert_eq!(options.program.as_deref(), Some("-"));
    }
}
