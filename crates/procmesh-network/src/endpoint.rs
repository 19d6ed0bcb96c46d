use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
};

use mio::{Interest, Registry, Token, net::UnixStream};
use tracing::debug;

use crate::codec::{self, Frame};

const RCV_BUF_SIZE: usize = 32 * 1024;

/// Response type for all external calls against an [`Endpoint`].
///
/// `Alive` means the connection is still usable. `Disconnected` means the
/// peer is gone (EOF or a fatal I/O error) and the caller must remove the
/// endpoint from the router.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

/// Which half of the stream a transient I/O error came from, reported to the
/// caller's `on_error` callback in [`Endpoint::poll_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Whether a newly enqueued frame is appended to the back of the send queue
/// (default FIFO) or pushed to the front. Per spec this is an advisory knob
/// only honoured on an explicit `flush_writes(false)` call, not a persistent
/// per-endpoint mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DequeuePosition {
    #[default]
    Back,
    Front,
}

/// Emitted once a queued frame's bytes are fully handed to the kernel,
/// carrying the frame as it was sent. The router uses this to run the
/// post-flush action: send the urgent signal to `frame.dst` if `urgent`,
/// and fire `onMessageSent` per the configured dispatch policy.
pub type FlushedFrame = Frame;

/// A frame that never made it out, surfaced to `onPeerShutdown` as a plain
/// record once the peer endpoint is torn down.
#[derive(Debug, Clone)]
pub struct UnsentFrame {
    pub dst: u32,
    pub serialize: bool,
    pub is_ack: bool,
    pub urgent: bool,
    pub broadcast: bool,
    pub alias: String,
    pub data: Vec<u8>,
}

impl From<&Frame> for UnsentFrame {
    fn from(frame: &Frame) -> Self {
        UnsentFrame {
            dst: frame.dst,
            serialize: frame.serialize,
            is_ack: frame.is_ack,
            urgent: frame.urgent,
            broadcast: frame.broadcast,
            alias: frame.alias.clone(),
            data: frame.payload.clone(),
        }
    }
}

/// Non-blocking byte-stream socket to one neighbour (parent or direct
/// child), created from a `socketpair()` at fork time.
///
/// Framing mirrors the wire codec's own accumulator model: reads land in a
/// scratch buffer, get appended to `read_accum`, and `try_decode` is called
/// repeatedly until it returns `None`. Writes go through a write cursor
/// (the current frame's unsent remainder) backed by a FIFO send queue.
pub struct Endpoint {
    pub pid: u32,
    stream: UnixStream,
    token: Token,

    read_accum: Vec<u8>,
    scratch: Vec<u8>,

    write_cursor: Option<(Vec<u8>, usize)>,
    /// The frame currently in `write_cursor`, handed back whole once the
    /// cursor fully drains.
    pending_flush: Option<Frame>,
    send_queue: VecDeque<Frame>,
    writable_armed: bool,
}

impl Endpoint {
    pub fn new(stream: UnixStream, pid: u32, token: Token) -> Self {
        Self {
            pid,
            stream,
            token,
            read_accum: Vec::with_capacity(RCV_BUF_SIZE),
            scratch: vec![0; RCV_BUF_SIZE],
            write_cursor: None,
            pending_flush: None,
            send_queue: VecDeque::with_capacity(16),
            writable_armed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    pub fn queued_frames(&self) -> usize {
        self.send_queue.len() + usize::from(self.write_cursor.is_some())
    }

    pub fn queued_bytes(&self) -> usize {
        let cursor_bytes = self.write_cursor.as_ref().map_or(0, |(buf, off)| buf.len() - off);
        let queue_bytes: usize = self.send_queue.iter().map(Frame::encoded_len).sum();
        cursor_bytes + queue_bytes
    }

    /// Drains both the write cursor and the send queue into plain records,
    /// for `onPeerShutdown`'s `unsent_frames` payload. Preserves enqueue
    /// order: whatever was already mid-flight (the cursor) comes first.
    pub fn take_unsent(&mut self) -> Vec<UnsentFrame> {
        let mut out = Vec::with_capacity(self.queued_frames());
        self.pending_flush = None;
        if let Some((bytes, offset)) = self.write_cursor.take() {
            // Best effort: the in-flight frame's metadata isn't retained once
            // encoded, so surface whatever is left as an opaque blob. In
            // practice loss here only affects the rare "killed mid-write"
            // scenario.
            out.push(UnsentFrame {
                dst: self.pid,
                serialize: true,
                is_ack: false,
                urgent: false,
                broadcast: false,
                alias: String::new(),
                data: bytes[offset..].to_vec(),
            });
        }
        for frame in self.send_queue.drain(..) {
            out.push(UnsentFrame::from(&frame));
        }
        out
    }

    pub fn enqueue(&mut self, frame: Frame, registry: &Registry, at: DequeuePosition) -> io::Result<()> {
        match at {
            DequeuePosition::Back => self.send_queue.push_back(frame),
            DequeuePosition::Front => self.send_queue.push_front(frame),
        }
        self.arm_writable(registry)
    }

    fn arm_writable(&mut self, registry: &Registry) -> io::Result<()> {
        if !self.writable_armed {
            registry.reregister(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE)?;
            self.writable_armed = true;
        }
        Ok(())
    }

    /// Services one readiness event: drains reads (decoding frames into
    /// `on_frame`) and/or drains writes (reporting flushes via `on_flushed`).
    /// Takes plain readiness bits rather than a borrowed `mio::event::Event`
    /// so a caller servicing many endpoints from one `Events` batch doesn't
    /// need to keep that batch borrowed while it also mutates the router.
    ///
    /// Only peer EOF tears down the connection. Any other I/O error
    /// (`EINTR`, `ECONNRESET`, ...) is transient: it's reported through
    /// `on_error` and the endpoint is left in place for the next readiness
    /// event, per the one true teardown path already living in
    /// `Router::service_endpoint`.
    pub fn poll_with(
        &mut self,
        registry: &Registry,
        readable: bool,
        writable: bool,
        on_frame: &mut impl FnMut(Frame),
        on_flushed: &mut impl FnMut(FlushedFrame),
        on_error: &mut impl FnMut(IoDirection, io::Error),
    ) -> ConnState {
        if readable && self.drain_reads(on_frame, on_error) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        if writable && self.drain_writes(registry, on_flushed, on_error) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Synchronous non-blocking read pass over this endpoint only, run
    /// outside the normal readiness loop when the urgent signal fires.
    /// Does not touch the write side.
    pub fn drain_urgent(&mut self, on_frame: &mut impl FnMut(Frame), on_error: &mut impl FnMut(IoDirection, io::Error)) -> ConnState {
        self.drain_reads(on_frame, on_error)
    }

    fn drain_reads(&mut self, on_frame: &mut impl FnMut(Frame), on_error: &mut impl FnMut(IoDirection, io::Error)) -> ConnState {
        loop {
            match self.stream.read(&mut self.scratch) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    self.read_accum.extend_from_slice(&self.scratch[..n]);
                    while let Some(frame) = codec::try_decode(&mut self.read_accum) {
                        on_frame(frame);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(err) => {
                    debug!(?err, pid = self.pid, "endpoint: transient read error");
                    on_error(IoDirection::Read, err);
                    return ConnState::Alive;
                }
            }
        }
    }

    fn drain_writes(
        &mut self,
        registry: &Registry,
        on_flushed: &mut impl FnMut(FlushedFrame),
        on_error: &mut impl FnMut(IoDirection, io::Error),
    ) -> ConnState {
        loop {
            if self.write_cursor.is_none() {
                let Some(frame) = self.send_queue.pop_front() else { break };
                let mut bytes = Vec::with_capacity(frame.encoded_len());
                codec::encode(&frame, &mut bytes);
                self.write_cursor = Some((bytes, 0));
                self.pending_flush = Some(frame);
            }

            let (bytes, offset) = self.write_cursor.as_mut().expect("checked above");
            match self.stream.write(&bytes[*offset..]) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    *offset += n;
                    if *offset == bytes.len() {
                        self.write_cursor = None;
                        if let Some(flushed) = self.pending_flush.take() {
                            on_flushed(flushed);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, pid = self.pid, "endpoint: transient write error");
                    on_error(IoDirection::Write, err);
                    return ConnState::Alive;
                }
            }
        }

        if self.write_cursor.is_none() && self.send_queue.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE) {
                debug!(?err, pid = self.pid, "endpoint: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
