pub(crate) const USAGE_MSG: &str = "usage: foreground [-hV] [--] program [arguments ...]";

const DESCRIPTOR: &str = "foreground - run a program as if it were the foreground process";

const HELP_MSG: &str = "Terminating signals are relayed to the program and foreground ends the
same way the program did: with its exit code or killed by the same signal.

Options:
  -h, --help               display help message and exit
  -V, --version            display version information and exit
  --                       stop processing command line arguments
";

pub(crate) fn long_help_message() -> String {
    format!("{USAGE_MSG}\n\n{DESCRIPTOR}\n\n{HELP_MSG}")
}
