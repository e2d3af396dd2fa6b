//! Framed messages over a Unix socket, with an optional file descriptor attached to each message.
//!
//! A frame is the payload length as a native-endian `u32` followed by the payload. When a
//! message carries a handle, the descriptor travels as `SCM_RIGHTS` ancillary data along with
//! the length.
use std::{
    collections::VecDeque,
    io, mem,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    cutils::{cerr, is_open_fd, is_socket, set_cloexec},
    log::dev_warn,
};

/// Environment variable naming the descriptor of the channel to the controlling process.
pub const CHANNEL_FD_VAR: &str = "FOREGROUND_CHANNEL_FD";

/// Descriptor number the channel is exposed under in the foreground child.
pub(crate) const CHILD_CHANNEL_FD: RawFd = 3;

/// Frames larger than this are rejected.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = mem::size_of::<u32>();

static CONTROLLER_TAKEN: AtomicBool = AtomicBool::new(false);

/// A message and the descriptor that accompanies it, if any.
#[derive(Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    pub handle: Option<OwnedFd>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            handle: None,
        }
    }

    pub fn with_handle(payload: impl Into<Vec<u8>>, handle: OwnedFd) -> Self {
        Self {
            payload: payload.into(),
            handle: Some(handle),
        }
    }
}

/// One end of a message channel.
#[derive(Debug)]
pub struct Channel {
    sock: UnixStream,
}

impl Channel {
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let (first, second) = UnixStream::pair()?;
        Ok((Channel { sock: first }, Channel { sock: second }))
    }

    /// Take the channel to the process that launched the current one.
    ///
    /// The channel is found through [`CHANNEL_FD_VAR`]. It can be taken at most once per process,
    /// later calls return `None`, as do calls in a process that was not given a channel or whose
    /// descriptor is not a socket.
    pub fn from_env() -> io::Result<Option<Channel>> {
        let Some(fd) = std::env::var(CHANNEL_FD_VAR)
            .ok()
            .and_then(|value| value.trim().parse::<RawFd>().ok())
        else {
            return Ok(None);
        };

        if fd < 0 || !is_open_fd(fd) {
            dev_warn!("{CHANNEL_FD_VAR}={fd} does not name an open descriptor");
            return Ok(None);
        }

        if !is_socket(fd) {
            dev_warn!("{CHANNEL_FD_VAR}={fd} does not name a socket");
            return Ok(None);
        }

        if CONTROLLER_TAKEN.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        // The descriptor must not leak into processes spawned from now on.
        set_cloexec(fd, true)?;

        // SAFETY: the descriptor is an open socket, was handed to this process to be used as its
        // channel and ownership can only be taken once thanks to `CONTROLLER_TAKEN`.
        let sock = unsafe { UnixStream::from_raw_fd(fd) };
        Ok(Some(Channel { sock }))
    }

    /// Send a message, and its handle if any.
    ///
    /// This blocks until the whole frame has been written.
    pub fn send(&self, message: &Message) -> io::Result<()> {
        let frame = encode(&message.payload)?;
        let mut handle = message.handle.as_ref().map(AsFd::as_fd);
        let mut offset = 0;

        while offset < frame.len() {
            match self.send_chunk(&frame[offset..], handle) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(sent) => {
                    offset += sent;
                    // The descriptor went with the first chunk.
                    handle = None;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Receive the next message. Returns `None` once the other end has been closed.
    ///
    /// This blocks until a whole frame has been read.
    pub fn recv(&self) -> io::Result<Option<Message>> {
        let mut reader = FrameReader::default();
        loop {
            match reader.read(self)? {
                Frame::Message(message) => return Ok(Some(message)),
                Frame::Closed => return Ok(None),
                Frame::Pending => {}
            }
        }
    }

    /// Stop sending messages through this channel, the other end will receive `None`.
    pub fn shutdown(&self) -> io::Result<()> {
        self.sock.shutdown(std::net::Shutdown::Write)
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.sock.set_nonblocking(nonblocking)
    }

    pub(crate) fn into_owned_fd(self) -> OwnedFd {
        self.sock.into()
    }

    /// Write as much of `bytes` as the socket takes in one call. `handle` is attached to the
    /// first byte.
    fn send_chunk(&self, bytes: &[u8], handle: Option<BorrowedFd>) -> io::Result<usize> {
        let mut control = ControlBuffer::new();
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        // SAFETY: all-zeroes is a valid `msghdr`, every pointer stored in it outlives the call to
        // `sendmsg` and the control buffer is large and aligned enough for one descriptor.
        let sent = unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;

            if let Some(handle) = handle {
                msg.msg_control = control.as_mut_ptr();
                msg.msg_controllen = ControlBuffer::space() as _;

                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as _) as _;
                ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), handle.as_raw_fd());
            }

            cerr(libc::sendmsg(self.sock.as_raw_fd(), &msg, SEND_FLAGS))?
        };

        Ok(sent as usize)
    }

    /// Read at most `buf.len()` bytes in one call, along with the descriptor that came with them.
    fn recv_chunk(&self, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
        let mut control = ControlBuffer::new();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };

        // SAFETY: all-zeroes is a valid `msghdr` and every pointer stored in it outlives the call
        // to `recvmsg`. The kernel reports in `msg_controllen` how much of the control buffer is
        // initialized and the `CMSG_*` macros never step outside of it.
        let (received, handle) = unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr();
            msg.msg_controllen = ControlBuffer::space() as _;

            let received = cerr(libc::recvmsg(self.sock.as_raw_fd(), &mut msg, RECV_FLAGS))?;

            let mut handle = None;
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let fd = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                    handle = Some(OwnedFd::from_raw_fd(fd));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }

            (received as usize, handle)
        };

        if let Some(handle) = &handle {
            set_cloexec(handle.as_raw_fd(), true)?;
        }

        Ok((received, handle))
    }
}

/// Header and payload of a message, ready to be written.
fn encode(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_MESSAGE_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_ne_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// What reading from a channel produced.
#[derive(Debug)]
pub(crate) enum Frame {
    /// A whole message arrived.
    Message(Message),
    /// No whole message is available yet.
    Pending,
    /// The other end was closed between two messages.
    Closed,
}

#[derive(Debug, Default, PartialEq, Eq)]
enum Stage {
    #[default]
    Header,
    Payload,
}

/// Reassembles frames that arrive in pieces, for use with non-blocking channels.
#[derive(Debug, Default)]
pub(crate) struct FrameReader {
    stage: Stage,
    header: [u8; HEADER_LEN],
    header_len: usize,
    payload: Vec<u8>,
    payload_len: usize,
    handle: Option<OwnedFd>,
}

impl FrameReader {
    /// Read from `channel` until a whole frame is available or the channel would block.
    pub(crate) fn read(&mut self, channel: &Channel) -> io::Result<Frame> {
        loop {
            if self.stage == Stage::Payload && self.payload_len == self.payload.len() {
                self.stage = Stage::Header;
                self.payload_len = 0;
                return Ok(Frame::Message(Message {
                    payload: mem::take(&mut self.payload),
                    handle: self.handle.take(),
                }));
            }

            let buf = match self.stage {
                Stage::Header => &mut self.header[self.header_len..],
                Stage::Payload => &mut self.payload[self.payload_len..],
            };

            let (received, handle) = match channel.recv_chunk(buf) {
                Ok(chunk) => chunk,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(Frame::Pending)
                }
                Err(err) => return Err(err),
            };

            if handle.is_some() {
                self.handle = handle;
            }

            if received == 0 {
                if self.stage == Stage::Header && self.header_len == 0 {
                    return Ok(Frame::Closed);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed in the middle of a message",
                ));
            }

            match self.stage {
                Stage::Header => {
                    self.header_len += received;
                    if self.header_len == HEADER_LEN {
                        let len = u32::from_ne_bytes(self.header) as usize;
                        if len > MAX_MESSAGE_LEN {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("message of {len} bytes exceeds the maximum size"),
                            ));
                        }
                        self.header_len = 0;
                        self.payload = vec![0u8; len];
                        self.stage = Stage::Payload;
                    }
                }
                Stage::Payload => self.payload_len += received,
            }
        }
    }
}

#[derive(Debug)]
struct Outgoing {
    frame: Vec<u8>,
    offset: usize,
    handle: Option<OwnedFd>,
}

/// Queue of frames waiting to be written to a non-blocking channel.
#[derive(Debug, Default)]
pub(crate) struct FrameWriter {
    queue: VecDeque<Outgoing>,
    queued: usize,
}

impl FrameWriter {
    pub(crate) fn push(&mut self, message: Message) -> io::Result<()> {
        let frame = encode(&message.payload)?;
        self.queued += frame.len();
        self.queue.push_back(Outgoing {
            frame,
            offset: 0,
            handle: message.handle,
        });
        Ok(())
    }

    /// Number of bytes waiting to be written.
    pub(crate) fn queued(&self) -> usize {
        self.queued
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every queued frame.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.queued = 0;
    }

    /// Write queued frames to `channel` until the queue is empty or the channel would block.
    pub(crate) fn flush(&mut self, channel: &Channel) -> io::Result<()> {
        while let Some(front) = self.queue.front_mut() {
            let handle = front.handle.as_ref().map(AsFd::as_fd);
            match channel.send_chunk(&front.frame[front.offset..], handle) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(sent) => {
                    front.offset += sent;
                    self.queued -= sent;
                    // The receiving end holds its own copy of the descriptor now.
                    front.handle = None;
                    if front.offset == front.frame.len() {
                        self.queue.pop_front();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

// A closed peer is reported as `EPIPE` instead of raising `SIGPIPE`.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Control buffer for a single descriptor, aligned for `cmsghdr`.
#[repr(C, align(8))]
struct ControlBuffer([u8; 64]);

impl ControlBuffer {
    fn new() -> Self {
        Self([0; 64])
    }

    fn space() -> usize {
        // SAFETY: `CMSG_SPACE` only performs arithmetic on its argument.
        unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as _) as usize }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.0.as_mut_ptr().cast()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}
