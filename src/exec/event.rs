use std::{collections::BTreeMap, io, os::fd::AsRawFd};

use crate::system::poll::{PollEvent, PollSet};

pub(super) trait Process: Sized {
    /// IO Events that this process should handle.
    type Event: Copy + Eq;
    /// Reason why the event loop should exit.
    ///
    /// See [`EventRegistry::set_exit`] for more information.
    type Exit;
    /// Handle the corresponding event.
    fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>);
}

#[derive(PartialEq, Eq, Hash, Ord, PartialOrd, Clone, Copy)]
struct EventId(usize);

/// A type able to register file descriptors to be polled.
pub(super) struct EventRegistry<T: Process> {
    seed: usize,
    poll_set: PollSet<EventId>,
    events: BTreeMap<EventId, T::Event>,
    exit: Option<T::Exit>,
}

impl<T: Process> EventRegistry<T> {
    /// Create a new and empty registry..
    pub(super) const fn new() -> Self {
        Self {
            seed: 0,
            poll_set: PollSet::new(),
            events: BTreeMap::new(),
            exit: None,
        }
    }

    fn next_id(&mut self) -> EventId {
        let id = EventId(self.seed);
        self.seed += 1;
        id
    }

    /// Set the `fd` descriptor to be polled for `poll_event` events and produce `event` when `fd`
    /// is ready.
    pub(super) fn register_event<F: AsRawFd>(
        &mut self,
        fd: &F,
        poll_event: PollEvent,
        event: T::Event,
    ) {
        let id = self.next_id();
        self.poll_set.add_fd(id, fd, poll_event);
        self.events.insert(id, event);
    }

    /// Stop polling the descriptor that produces `event`. Returns `false` if no such descriptor
    /// was registered.
    pub(super) fn deregister_event(&mut self, event: T::Event) -> bool {
        let Some(id) = self
            .events
            .iter()
            .find_map(|(&id, &registered_event)| (registered_event == event).then_some(id))
        else {
            return false;
        };

        self.events.remove(&id);
        self.poll_set.remove_fd(id)
    }

    /// Whether a descriptor currently produces `event`.
    pub(super) fn is_registered(&self, event: T::Event) -> bool {
        self.events.values().any(|&registered| registered == event)
    }

    /// Stop the event loop when the callbacks for the events that are ready by now have been
    /// dispatched and set a reason for it.
    pub(super) fn set_exit(&mut self, reason: T::Exit) {
        self.exit = Some(reason);
    }

    /// Run the event loop for this handler.
    ///
    /// The event loop will continue until [`EventRegistry::set_exit`] is called or `poll` fails
    /// with anything other than `EINTR`. An event deregistered by an earlier callback of the same
    /// round is not dispatched.
    pub(super) fn event_loop(&mut self, process: &mut T) -> io::Result<T::Exit> {
        loop {
            let ids = match self.poll_set.poll() {
                Ok(ids) => ids,
                // A signal arrived, it will be reported by the next call.
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };

            for id in ids {
                let Some(&event) = self.events.get(&id) else {
                    continue;
                };

                process.on_event(event, self);

                if let Some(reason) = self.exit.take() {
                    return Ok(reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::unix::net::UnixStream,
    };

    use crate::system::poll::PollEvent;

    use super::{EventRegistry, Process};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Left,
        Right,
    }

    struct Counter {
        left: UnixStream,
        right: UnixStream,
        seen: Vec<Event>,
    }

    impl Process for Counter {
        type Event = Event;
        type Exit = usize;

        fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>) {
            let mut buf = [0u8; 1];
            let sock = match event {
                Event::Left => &mut self.left,
                Event::Right => &mut self.right,
            };
            if sock.read(&mut buf).unwrap() == 0 {
                registry.deregister_event(event);
                if event == Event::Right {
                    registry.set_exit(self.seen.len());
                }
                return;
            }
            self.seen.push(event);
            if self.seen.len() == 3 {
                registry.set_exit(self.seen.len());
            }
        }
    }

    #[test]
    fn exits_after_dispatching() {
        let (left, mut left_tx) = UnixStream::pair().unwrap();
        let (right, mut right_tx) = UnixStream::pair().unwrap();
        let mut registry = EventRegistry::new();
        registry.register_event(&left, PollEvent::Readable, Event::Left);
        registry.register_event(&right, PollEvent::Readable, Event::Right);

        left_tx.write_all(&[1, 2]).unwrap();
        right_tx.write_all(&[3]).unwrap();

        let mut counter = Counter {
            left,
            right,
            seen: Vec::new(),
        };

        assert_eq!(registry.event_loop(&mut counter).unwrap(), 3);
        assert_eq!(counter.seen.iter().filter(|&&e| e == Event::Left).count(), 2);
    }

    #[test]
    fn exits_and_deregisters() {
        let (left, _left_tx) = UnixStream::pair().unwrap();
        let (right, right_tx) = UnixStream::pair().unwrap();
        let mut registry = EventRegistry::new();
        registry.register_event(&left, PollEvent::Readable, Event::Left);
        registry.register_event(&right, PollEvent::Readable, Event::Right);
        drop(right_tx);

        let mut counter = Counter {
            left,
            right,
            seen: Vec::new(),
        };

        assert_eq!(registry.event_loop(&mut counter).unwrap(), 0);
        assert!(!registry.is_registered(Event::Right));
        assert!(!registry.deregister_event(Event::Right));
        assert!(registry.deregister_event(Event::Left));
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        First,
        Second,
        Stop,
    }

    /// Deregisters `Second` while handling `First`, then exits through `Stop`.
    struct Preempt {
        first: UnixStream,
        _stop: Option<UnixStream>,
        seen: Vec<Step>,
    }

    impl Process for Preempt {
        type Event = Step;
        type Exit = ();

        fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>) {
            self.seen.push(event);
            match event {
                Step::First => {
                    let mut buf = [0u8; 1];
                    self.first.read_exact(&mut buf).unwrap();
                    assert!(registry.deregister_event(Step::Second));

                    let (stop, mut stop_tx) = UnixStream::pair().unwrap();
                    stop_tx.write_all(&[0]).unwrap();
                    registry.register_event(&stop, PollEvent::Readable, Step::Stop);
                    self._stop = Some(stop);
                }
                Step::Second => {}
                Step::Stop => registry.set_exit(()),
            }
        }
    }

    #[test]
    fn deregistered_events_are_not_dispatched() {
        let (first, mut first_tx) = UnixStream::pair().unwrap();
        let (second, mut second_tx) = UnixStream::pair().unwrap();
        let mut registry = EventRegistry::new();
        registry.register_event(&first, PollEvent::Readable, Step::First);
        registry.register_event(&second, PollEvent::Readable, Step::Second);

        first_tx.write_all(&[1]).unwrap();
        second_tx.write_all(&[2]).unwrap();

        let mut process = Preempt {
            first,
            _stop: None,
            seen: Vec::new(),
        };

        registry.event_loop(&mut process).unwrap();
        assert_eq!(process.seen, vec![Step::First, Step::Stop]);
    }

    #[test]
    fn poll_failures_end_the_loop() {
        crate::exec::tests::in_forked_process(|| {
            let (left, right) = UnixStream::pair().unwrap();
            let (extra, _extra_tx) = UnixStream::pair().unwrap();
            let mut registry = EventRegistry::new();
            registry.register_event(&left, PollEvent::Readable, Event::Left);
            registry.register_event(&extra, PollEvent::Readable, Event::Right);

            // `poll` rejects more descriptors than `RLIMIT_NOFILE` allows with `EINVAL`.
            let mut limit = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            // SAFETY: `limit` is a valid `rlimit` for both calls.
            #[allow(unsafe_code)]
            unsafe {
                assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit), 0);
                limit.rlim_cur = 1;
                assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &limit), 0);
            }

            let mut counter = Counter {
                left,
                right,
                seen: Vec::new(),
            };
            let err = registry.event_loop(&mut counter).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
            assert!(counter.seen.is_empty());
        });
    }
}
