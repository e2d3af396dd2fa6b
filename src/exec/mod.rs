#![deny(unsafe_code)]

mod completion;
mod event;
mod exit_hook;
mod relay;

use std::{
    convert::Infallible,
    fmt,
    io::{self, Read},
    os::{
        fd::{AsRawFd, RawFd},
        unix::{net::UnixStream, process::CommandExt},
    },
    process::{Command, Stdio},
    time::Duration,
};

use crate::{
    channel::{
        Channel, Frame, FrameReader, FrameWriter, Message, CHANNEL_FD_VAR, CHILD_CHANNEL_FD,
        MAX_MESSAGE_LEN,
    },
    cutils::set_cloexec,
    invocation::{CallArg, Invocation},
    log::{dev_debug, dev_error, dev_info, dev_warn, user_error},
    system::{
        dup2, getpid,
        interface::ProcessId,
        kill,
        poll::PollEvent,
        signal::{
            consts::SIGCHLD, signal_name, SignalHandler, SignalHandlerBehavior, SignalNumber,
            SignalSet, SignalStream, FORBIDDEN,
        },
        wait::{Wait, WaitError, WaitOptions},
    },
};

pub use completion::{CloseHandler, Completion, ExitStatus};
pub(crate) use completion::default_close_handler;

use self::{
    event::{EventRegistry, Process},
    exit_hook::ExitHook,
    relay::SignalRelay,
};

/// How long the current process waits to be killed by the signal it sent itself before giving up
/// and exiting with `128 + signal`.
const SAFETY_DELAY: Duration = Duration::from_millis(200);

/// Normalize `call`, launch the foreground child and run until the current process ends the same
/// way the child did.
///
/// This only returns if setting up the child failed.
pub fn foreground_child(call: Vec<CallArg>) -> io::Result<Infallible> {
    let child = launch(Invocation::normalize(call))?;
    child.run()
}

/// A child process launched in the foreground of the current one.
///
/// Until [`ForegroundChild::run`] is called, terminating signals received by the current process
/// are held back and the child closing goes unnoticed.
pub struct ForegroundChild {
    pid: Option<ProcessId>,
    /// Pending status if spawning the child failed.
    spawn_failure: Option<ExitStatus>,
    hook: CloseHandler,
    relay: Option<SignalRelay>,
    sigchld_handler: Option<SignalHandler>,
    exit_hook: Option<ExitHook>,
    signal_stream: &'static SignalStream,
    waker: UnixStream,
    wake_rx: UnixStream,
    bridge: Option<Bridge>,
}

/// The two ends of the message channel bridge.
///
/// Both ends are switched to non-blocking mode once [`ForegroundChild::run`] starts, frames are
/// then moved piece by piece as the event loop reports the sockets ready.
struct Bridge {
    controller: Channel,
    child: Channel,
    /// Frames from the controller to the child.
    downstream: Flow,
    /// Frames from the child to the controller.
    upstream: Flow,
}

/// One direction of the bridge.
#[derive(Default)]
struct Flow {
    reader: FrameReader,
    writer: FrameWriter,
    /// Nothing more will be read from the source.
    source_closed: bool,
    /// Writing to the sink failed, further frames are dropped.
    sink_failed: bool,
    /// The write half of the sink has been shut down.
    sink_shut: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Controller,
    Child,
}

impl Side {
    fn peer(self) -> Self {
        match self {
            Side::Controller => Side::Child,
            Side::Child => Side::Controller,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Controller => f.write_str("controller"),
            Side::Child => f.write_str("child"),
        }
    }
}

impl Bridge {
    fn new(controller: Channel, child: Channel) -> Self {
        Self {
            controller,
            child,
            downstream: Flow::default(),
            upstream: Flow::default(),
        }
    }

    fn channel(&self, side: Side) -> &Channel {
        match side {
            Side::Controller => &self.controller,
            Side::Child => &self.child,
        }
    }

    /// The source, the sink and the flow of frames read from `source`.
    fn route(&mut self, source: Side) -> (&Channel, &Channel, &mut Flow) {
        match source {
            Side::Controller => (&self.controller, &self.child, &mut self.downstream),
            Side::Child => (&self.child, &self.controller, &mut self.upstream),
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        self.controller.set_nonblocking(true)?;
        self.child.set_nonblocking(true)
    }

    fn receive(&mut self, source: Side, registry: &mut EventRegistry<ForegroundClosure>) {
        let (from, _, flow) = self.route(source);

        match flow.reader.read(from) {
            Ok(Frame::Message(message)) => {
                if !flow.sink_failed {
                    if let Err(err) = flow.writer.push(message) {
                        dev_warn!("cannot forward message from {source}: {err}");
                    }
                }
            }
            Ok(Frame::Pending) => {}
            Ok(Frame::Closed) => {
                dev_debug!("{source} closed its message channel");
                flow.source_closed = true;
            }
            Err(err) => {
                dev_warn!("cannot receive message from {source}: {err}");
                flow.source_closed = true;
            }
        }

        self.pump(source, registry);
    }

    /// Write what is queued for the peer of `source` and update which events are polled.
    fn pump(&mut self, source: Side, registry: &mut EventRegistry<ForegroundClosure>) {
        let sink = source.peer();
        let (from, to, flow) = self.route(source);

        if !flow.sink_failed {
            if let Err(err) = flow.writer.flush(to) {
                dev_warn!("cannot forward message from {source}: {err}");
                flow.sink_failed = true;
                flow.writer.clear();
            }
        }

        let transmit = ForegroundEvent::Transmit(sink);
        let writing = !flow.writer.is_empty();
        if writing != registry.is_registered(transmit) {
            if writing {
                registry.register_event(to, PollEvent::Writable, transmit);
            } else {
                registry.deregister_event(transmit);
            }
        }

        // Reading pauses while the sink lags behind.
        let receive = ForegroundEvent::Receive(source);
        let reading = !flow.source_closed && flow.writer.queued() <= MAX_MESSAGE_LEN;
        if reading != registry.is_registered(receive) {
            if reading {
                registry.register_event(from, PollEvent::Readable, receive);
            } else {
                registry.deregister_event(receive);
            }
        }

        if flow.source_closed && flow.writer.is_empty() && !flow.sink_shut {
            flow.sink_shut = true;
            if !flow.sink_failed {
                if let Err(err) = to.shutdown() {
                    dev_warn!("cannot close the message channel to {sink}: {err}");
                }
            }
        }
    }
}

/// Spawn the child described by `invocation` in the foreground of the current process.
///
/// Failing to spawn the child is not an error: it is reported and the current process ends with
/// `127` if the program could not be found or with `126` otherwise once [`ForegroundChild::run`]
/// is called.
pub fn launch(invocation: Invocation) -> io::Result<ForegroundChild> {
    let Invocation {
        program,
        args,
        hook,
    } = invocation;

    // Taken before any descriptor of our own is opened, so a stale number in the environment
    // cannot name one of them. No one else may read from it.
    let controller = Channel::from_env()?;

    let signal_stream = SignalStream::get()?;
    let (waker, wake_rx) = UnixStream::pair()?;

    let channels = match controller {
        Some(controller) => {
            let (parent_end, child_end) = Channel::pair()?;
            Some((controller, parent_end, child_end.into_owned_fd()))
        }
        None => None,
    };

    let mut command = Command::new(&program);
    command
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    match &channels {
        Some(_) => {
            command.env(CHANNEL_FD_VAR, CHILD_CHANNEL_FD.to_string());
        }
        None => {
            command.env_remove(CHANNEL_FD_VAR);
        }
    }

    // Block all the signals until the handlers are set up so SIGCHLD and the signals meant for
    // the child are not missed.
    let original_set = match SignalSet::full().and_then(|set| set.block()) {
        Ok(original_set) => Some(original_set),
        Err(err) => {
            dev_warn!("cannot block signals: {err}");
            None
        }
    };

    prepare_child(
        &mut command,
        original_set,
        channels.as_ref().map(|(_, _, child_end)| child_end.as_raw_fd()),
    );

    let setup = spawn_and_watch(&mut command, &program);

    // Restore the signal mask now that the handlers have been setup.
    if let Some(set) = original_set {
        if let Err(err) = set.set_mask() {
            dev_warn!("cannot restore signal mask: {err}");
        }
    }

    let watch = setup?;

    // The child holds its own copy of its end of the channel now.
    drop(command);
    let bridge = channels.and_then(|(controller, parent_end, child_end)| {
        drop(child_end);
        watch.pid.map(|_| Bridge::new(controller, parent_end))
    });

    Ok(ForegroundChild {
        pid: watch.pid,
        spawn_failure: watch.spawn_failure,
        hook,
        relay: watch.relay,
        sigchld_handler: watch.sigchld_handler,
        exit_hook: watch.exit_hook,
        signal_stream,
        waker,
        wake_rx,
        bridge,
    })
}

/// Restore `mask` in the child before it executes the program and make `channel` available
/// there as [`CHILD_CHANNEL_FD`].
fn prepare_child(command: &mut Command, mask: Option<SignalSet>, channel: Option<RawFd>) {
    #[allow(unsafe_code)]
    // SAFETY: the closure only calls `sigprocmask`, `fcntl` and `dup2`, which are
    // async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            if let Some(set) = mask {
                set.set_mask()?;
            }

            match channel {
                Some(fd) if fd == CHILD_CHANNEL_FD => set_cloexec(fd, false),
                Some(fd) => dup2(fd, CHILD_CHANNEL_FD),
                None => Ok(()),
            }
        });
    }
}

struct Watch {
    pid: Option<ProcessId>,
    spawn_failure: Option<ExitStatus>,
    relay: Option<SignalRelay>,
    sigchld_handler: Option<SignalHandler>,
    exit_hook: Option<ExitHook>,
}

fn spawn_and_watch(command: &mut Command, program: &str) -> io::Result<Watch> {
    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            user_error!("cannot run '{program}': {err}");
            let code = if err.kind() == io::ErrorKind::NotFound {
                127
            } else {
                126
            };
            return Ok(Watch {
                pid: None,
                spawn_failure: Some(ExitStatus::Code(code)),
                relay: None,
                sigchld_handler: None,
                exit_hook: None,
            });
        }
    };

    let pid = ProcessId::from(child.id());
    dev_info!("launched '{program}' with pid {pid}");

    // Armed first so the child is hung up if the rest of the setup fails.
    let exit_hook = ExitHook::arm(pid)?;
    let sigchld_handler = SignalHandler::register(SIGCHLD, SignalHandlerBehavior::Stream)?;
    let relay = SignalRelay::install(pid)?;

    Ok(Watch {
        pid: Some(pid),
        spawn_failure: None,
        relay: Some(relay),
        sigchld_handler: Some(sigchld_handler),
        exit_hook: Some(exit_hook),
    })
}

impl ForegroundChild {
    /// The child's process ID, `None` if spawning it failed or once it has been reaped.
    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    /// Send `signal` to the child.
    pub fn kill(&self, signal: SignalNumber) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "there is no child process"))?;
        kill(pid, signal)
    }

    /// Send a message to the child through the message channel.
    pub fn send(&self, message: &Message) -> io::Result<()> {
        match &self.bridge {
            Some(bridge) => bridge.channel(Side::Child).send(message),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "the child has no message channel",
            )),
        }
    }

    /// Wait for the child to close, let the close handler run and end the current process with
    /// the status it settled on.
    pub fn run(self) -> ! {
        let mut registry = EventRegistry::new();
        let mut closure = ForegroundClosure::new(self, &mut registry);

        if let Some(status) = closure.spawn_failure.take() {
            closure.close(status);
        }

        match registry.event_loop(&mut closure) {
            Ok(status) => terminate(status),
            Err(err) => {
                user_error!("cannot wait for the child: {err}");
                // Hangs up the child if it is still running.
                drop(closure);
                std::process::exit(1)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForegroundEvent {
    Signal,
    Proceed,
    /// A side of the bridge has data to read.
    Receive(Side),
    /// A side of the bridge can take more data.
    Transmit(Side),
}

enum Lifecycle {
    /// The child has not closed yet.
    Running,
    /// The child closed, waiting for the close handler to proceed.
    Closing(Completion),
    /// Teardown is done, the current process is about to end.
    Finalized,
}

struct ForegroundClosure {
    pid: Option<ProcessId>,
    spawn_failure: Option<ExitStatus>,
    hook: Option<CloseHandler>,
    relay: Option<SignalRelay>,
    sigchld_handler: Option<SignalHandler>,
    exit_hook: Option<ExitHook>,
    signal_stream: &'static SignalStream,
    waker: Option<UnixStream>,
    wake_rx: UnixStream,
    bridge: Option<Bridge>,
    lifecycle: Lifecycle,
}

impl ForegroundClosure {
    fn new(child: ForegroundChild, registry: &mut EventRegistry<Self>) -> Self {
        registry.register_event(child.signal_stream, PollEvent::Readable, ForegroundEvent::Signal);
        registry.register_event(&child.wake_rx, PollEvent::Readable, ForegroundEvent::Proceed);

        let bridge = child.bridge.and_then(|bridge| match bridge.set_nonblocking() {
            Ok(()) => Some(bridge),
            Err(err) => {
                dev_error!("cannot bridge the message channel: {err}");
                None
            }
        });

        if let Some(bridge) = &bridge {
            for side in [Side::Controller, Side::Child] {
                registry.register_event(
                    bridge.channel(side),
                    PollEvent::Readable,
                    ForegroundEvent::Receive(side),
                );
            }
        }

        Self {
            pid: child.pid,
            spawn_failure: child.spawn_failure,
            hook: Some(child.hook),
            relay: child.relay,
            sigchld_handler: child.sigchld_handler,
            exit_hook: child.exit_hook,
            signal_stream: child.signal_stream,
            waker: Some(child.waker),
            wake_rx: child.wake_rx,
            bridge,
            lifecycle: Lifecycle::Running,
        }
    }

    fn on_signal(&mut self) {
        let info = match self.signal_stream.recv() {
            Ok(info) => info,
            Err(err) => {
                dev_error!("could not receive signal: {err}");
                return;
            }
        };

        let signal = info.signal();
        dev_debug!("received {} from {}", signal_name(signal), info.pid());

        let Some(child_pid) = self.pid else {
            dev_debug!("child was already reaped, ignoring {}", signal_name(signal));
            return;
        };

        if signal == SIGCHLD {
            self.check_child(child_pid);
            return;
        }

        // Relayed even when the child sent it: every terminating signal the current process
        // receives reaches the child.
        if let Some(relay) = &self.relay {
            relay.forward(signal);
        }
    }

    fn check_child(&mut self, child_pid: ProcessId) {
        let status = match child_pid.wait(WaitOptions::new().no_hang()) {
            Ok((_, status)) => status,
            Err(WaitError::NotReady) => return,
            Err(WaitError::Io(err)) => {
                dev_warn!("cannot wait for {child_pid}: {err}");
                return;
            }
        };

        if let Some(code) = status.exit_status() {
            dev_info!("{child_pid} exited with status code {code}");
            self.close(ExitStatus::Code(code));
        } else if let Some(signal) = status.term_signal() {
            dev_info!("{child_pid} was terminated by {}", signal_name(signal));
            self.close(ExitStatus::Signal(signal));
        }
    }

    /// The child is gone: record the pending status and hand it to the close handler.
    fn close(&mut self, status: ExitStatus) {
        if !matches!(self.lifecycle, Lifecycle::Running) {
            return;
        }

        self.pid = None;
        // The child has been reaped and its pid may be reused.
        if let Some(mut exit_hook) = self.exit_hook.take() {
            exit_hook.disarm();
        }

        let Some(waker) = self.waker.take() else {
            return;
        };
        let completion = Completion::new(status, waker);
        self.lifecycle = Lifecycle::Closing(completion.clone());

        if let Some(hook) = self.hook.take() {
            hook(completion);
        }
    }

    fn on_proceed(&mut self, registry: &mut EventRegistry<Self>) {
        let mut buf = [0u8; 1];
        match (&self.wake_rx).read(&mut buf) {
            Ok(0) => {
                registry.deregister_event(ForegroundEvent::Proceed);
                return;
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
            Err(err) => dev_warn!("cannot read wake up: {err}"),
        }

        if !matches!(self.lifecycle, Lifecycle::Closing(_)) {
            return;
        }
        let Lifecycle::Closing(completion) =
            std::mem::replace(&mut self.lifecycle, Lifecycle::Finalized)
        else {
            return;
        };

        if let Some(mut relay) = self.relay.take() {
            relay.uninstall();
        }
        self.sigchld_handler.take();
        if let Some(mut exit_hook) = self.exit_hook.take() {
            exit_hook.disarm();
        }

        let status = completion.status();
        dev_info!("finalizing with {status}");
        registry.set_exit(status);
    }

    fn on_bridge(&mut self, event: ForegroundEvent, registry: &mut EventRegistry<Self>) {
        let Some(bridge) = &mut self.bridge else {
            registry.deregister_event(event);
            return;
        };

        match event {
            ForegroundEvent::Receive(source) => bridge.receive(source, registry),
            ForegroundEvent::Transmit(sink) => bridge.pump(sink.peer(), registry),
            ForegroundEvent::Signal | ForegroundEvent::Proceed => {}
        }
    }
}

impl Process for ForegroundClosure {
    type Event = ForegroundEvent;
    type Exit = ExitStatus;

    fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>) {
        match event {
            ForegroundEvent::Signal => self.on_signal(),
            ForegroundEvent::Proceed => self.on_proceed(registry),
            ForegroundEvent::Receive(_) | ForegroundEvent::Transmit(_) => {
                self.on_bridge(event, registry)
            }
        }
    }
}

/// End the current process with `status`.
///
/// For [`ExitStatus::Signal`] the current process kills itself with the same signal, if that does
/// not end it within [`SAFETY_DELAY`] it exits with `128 + signal`.
fn terminate(status: ExitStatus) -> ! {
    let signal = match status {
        ExitStatus::Code(code) => std::process::exit(code),
        ExitStatus::Signal(signal) => signal,
    };

    if !FORBIDDEN.contains(&signal) {
        match SignalHandler::register(signal, SignalHandlerBehavior::Default) {
            Ok(handler) => handler.forget(),
            Err(err) => dev_warn!("cannot restore default action for {}: {err}", signal_name(signal)),
        }
    }

    if let Err(err) = SignalSet::single(signal).and_then(|set| set.unblock()) {
        dev_warn!("cannot unblock {}: {err}", signal_name(signal));
    }

    if let Err(err) = kill(getpid(), signal) {
        dev_warn!("cannot send {} to self: {err}", signal_name(signal));
    }

    std::thread::sleep(SAFETY_DELAY);
    std::process::exit(status.code())
}
