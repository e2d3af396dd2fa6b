#[derive(Debug, PartialEq)]
pub(crate) struct ForegroundOptions {
    pub(crate) action: ForegroundAction,
    pub(crate) program: Option<String>,
    pub(crate) arguments: Vec<String>,
}

impl Default for ForegroundOptions {
    fn default() -> Self {
        Self {
            action: ForegroundAction::Run,
            program: None,
            arguments: Vec::new(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum ForegroundAction {
    Help,
    Version,
    Run,
}

type OptionSetter = fn(&mut ForegroundOptions);

struct ForegroundOption {
    short: char,
    long: &'static str,
    set: OptionSetter,
}

impl ForegroundOptions {
    const FOREGROUND_OPTIONS: &'static [ForegroundOption] = &[
        ForegroundOption {
            short: 'h',
            long: "help",
            set: |options| options.action = ForegroundAction::Help,
        },
        ForegroundOption {
            short: 'V',
            long: "version",
            set: |options| options.action = ForegroundAction::Version,
        },
    ];

    pub(crate) fn from_env() -> Result<ForegroundOptions, String> {
        let args = std::env::args().collect();

        Self::parse_arguments(args)
    }

    /// Parse the command line, options stop at the first operand or at `--`.
    pub(crate) fn parse_arguments(arguments: Vec<String>) -> Result<ForegroundOptions, String> {
        let mut options = ForegroundOptions::default();
        let mut arg_iter = arguments.into_iter().skip(1);

        while let Some(arg) = arg_iter.next() {
            if arg == "--" {
                options.program = arg_iter.next();
                break;
            } else if let Some(long) = arg.strip_prefix("--") {
                let (name, value) = match long.split_once('=') {
                    Some((name, value)) => (name, Some(value)),
                    None => (long, None),
                };
                let option = Self::FOREGROUND_OPTIONS
                    .iter()
                    .find(|o| o.long == name)
                    .ok_or_else(|| format!("unrecognized option '{arg}'"))?;
                if value.is_some() {
                    Err(format!("'--{}' does not take any arguments", option.long))?;
                }
                (option.set)(&mut options);
            } else if arg.starts_with('-') && arg.len() > 1 {
                // flags can be grouped
                for char in arg.chars().skip(1) {
                    let option = Self::FOREGROUND_OPTIONS
                        .iter()
                        .find(|o| o.short == char)
                        .ok_or_else(|| format!("invalid option -- '{char}'"))?;
                    (option.set)(&mut options);
                }
            } else {
                options.program = Some(arg);
                break;
            }
        }

        options.arguments = arg_iter.collect();

        if options.action == ForegroundAction::Run && options.program.is_none() {
            Err("no program given")?;
        }

        Ok(options)
    }
}
