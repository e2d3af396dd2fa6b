pub fn cerr<Int: Copy + TryInto<libc::c_long>>(res: Int) -> std::io::Result<Int> {
    match res.try_into() {
        Ok(-1) => Err(std::io::Error::last_os_error()),
        _ => Ok(res),
    }
}

/// Check whether `fd` refers to an open file descriptor of this process.
pub fn is_open_fd(fd: libc::c_int) -> bool {
    // SAFETY: `F_GETFD` only queries the descriptor flags and fails with `EBADF` if `fd` is not
    // open.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Check whether `fd` is an open descriptor referring to a socket.
pub fn is_socket(fd: libc::c_int) -> bool {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `fstat` fails with `EBADF` if `fd` is not open and fills `stat` otherwise.
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == -1 {
        return false;
    }
    // SAFETY: `fstat` succeeded so `stat` is initialized.
    let mode = unsafe { stat.assume_init() }.st_mode;
    mode & libc::S_IFMT == libc::S_IFSOCK
}

/// Set or clear the close-on-exec flag of `fd`.
pub fn set_cloexec(fd: libc::c_int, cloexec: bool) -> std::io::Result<()> {
    // SAFETY: `fcntl` with `F_GETFD`/`F_SETFD` cannot cause UB even if `fd` is not open.
    let flags = cerr(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let flags = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    cerr(unsafe { libc::fcntl(fd, libc::F_SETFD, flags) }).map(|_| ())
}

#[cfg(test)]
mod test {
    use std::{
        fs::File,
        os::{fd::AsRawFd, unix::net::UnixStream},
    };

    use super::{cerr, is_open_fd, is_socket, set_cloexec};

    #[test]
    fn test_cerr() {
        assert_eq!(cerr(5).unwrap(), 5);
        assert_eq!(cerr(0).unwrap(), 0);
        assert!(cerr(-1).is_err());
    }

    #[test]
    fn cloexec_roundtrip() {
        let (sock, _other) = UnixStream::pair().unwrap();
        let fd = sock.as_raw_fd();
        assert!(is_open_fd(fd));

        set_cloexec(fd, false).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        set_cloexec(fd, true).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn only_sockets_are_sockets() {
        let (sock, _other) = UnixStream::pair().unwrap();
        assert!(is_socket(sock.as_raw_fd()));

        let file = File::open("/dev/null").unwrap();
        assert!(is_open_fd(file.as_raw_fd()));
        assert!(!is_socket(file.as_raw_fd()));

        assert!(!is_socket(-1));
    }
}
