// the `std::print` macros panic when stdout or stderr are closed, which must not take down a
// process whose only job is to mirror its child
macro_rules! println_ignore_io_error {
    ($($tt:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stdout(), $($tt)*);
    }}
}

macro_rules! eprintln_ignore_io_error {
    ($($tt:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($tt)*);
    }}
}

// catch unintentional uses of `print*` macros outside of tests
#[allow(unused_macros)]
#[cfg(all(debug_assertions, not(test)))]
macro_rules! eprintln {
    ($($tt:tt)*) => {
        compile_error!("do not use `eprintln!`; use `eprintln_ignore_io_error!` or a `user_*` log macro instead")
    };
}

#[allow(unused_macros)]
#[cfg(all(debug_assertions, not(test)))]
macro_rules! println {
    ($($tt:tt)*) => {
        compile_error!("do not use `println!`; use `println_ignore_io_error!` instead")
    };
}
