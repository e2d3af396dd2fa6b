use std::{
    collections::BTreeMap,
    io,
    os::fd::{AsRawFd, RawFd},
};

use crate::cutils::cerr;
use libc::{c_short, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

/// The kind of event that will be monitored for a file descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// Data may be read without blocking.
    Readable,
    /// Data may be written without blocking.
    Writable,
}

/// A set of indexed file descriptors to be polled using the [`poll`](https://manpage.me/?q=poll) system call.
pub struct PollSet<K> {
    fds: BTreeMap<K, (RawFd, c_short)>,
}

impl<K: Eq + PartialEq + Ord + PartialOrd + Clone> PollSet<K> {
    /// Create an empty set of file descriptors.
    pub const fn new() -> Self {
        Self {
            fds: BTreeMap::new(),
        }
    }

    /// Add a file descriptor under the provided key. This descriptor will be checked for the given
    /// poll event.
    ///
    /// If the provided key is already in the set, calling this function will overwrite the file
    /// descriptor for that key.
    pub fn add_fd<F: AsRawFd>(&mut self, key: K, fd: &F, event: PollEvent) {
        let event = match event {
            PollEvent::Readable => POLLIN,
            PollEvent::Writable => POLLOUT,
        };
        self.fds.insert(key, (fd.as_raw_fd(), event));
    }

    /// Stop polling the file descriptor under the provided key. Returns `false` if there was no
    /// descriptor under that key.
    pub fn remove_fd(&mut self, key: K) -> bool {
        self.fds.remove(&key).is_some()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Poll the set of file descriptors and return the key of the descriptors that are ready to be
    /// read or written.
    ///
    /// Calling this function will block until one of the file descriptors in the set is ready.
    /// A descriptor whose peer hung up, that has a pending error or that is not open anymore is
    /// reported as ready so the next read or write on it observes what happened.
    pub fn poll(&mut self) -> io::Result<Vec<K>> {
        let mut fds: Vec<pollfd> = self
            .fds
            .values()
            .map(|&(fd, events)| pollfd {
                fd,
                events,
                revents: 0,
            })
            .collect();

        let n = cerr(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as _, -1) })?;

        let mut keys = Vec::with_capacity(n as usize);

        for (key, fd) in self.fds.keys().zip(fds) {
            let events = fd.events & fd.revents;

            if (events & (POLLIN | POLLOUT) != 0)
                || (fd.revents & (POLLHUP | POLLERR | POLLNVAL) != 0)
            {
                keys.push(key.clone());
            }
        }

        Ok(keys)
    }
}
