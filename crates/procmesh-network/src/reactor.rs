//! Single-threaded readiness multiplexer. Wraps `mio::Poll`, and defers
//! signal delivery the way [`signal_hook::flag`] registrations do elsewhere
//! in this workspace: a handler only flips an atomic, the flag is drained
//! and turned into a callback between dispatches, never from inside the
//! actual OS signal frame. This keeps the "signals are delivered as
//! callbacks between dispatches" contract sound (no allocation or socket
//! I/O ever runs inside a real signal handler) while preserving the
//! observable behaviour: by the time the next normal event is dispatched,
//! any pending SIGCHLD/urgent work has already run.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use mio::{Events, Interest as MioInterest, Poll, Registry, Token, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl From<Interest> for MioInterest {
    fn from(i: Interest) -> Self {
        match i {
            Interest::Read => MioInterest::READABLE,
            Interest::Write => MioInterest::WRITABLE,
            Interest::ReadWrite => MioInterest::READABLE | MioInterest::WRITABLE,
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    sigchld_flag: Arc<AtomicUsize>,
    urgent_flag: Arc<AtomicUsize>,
    urgent_signo: i32,
}

impl Reactor {
    /// Builds a reactor and installs the SIGCHLD and urgent-signal flag
    /// handlers. `urgent_signo` is the signal used for the preemptive
    /// drain path (default `SIGUSR1`, configurable per executor).
    pub fn new(urgent_signo: i32) -> io::Result<Self> {
        let sigchld_flag = Arc::new(AtomicUsize::new(0));
        let urgent_flag = Arc::new(AtomicUsize::new(0));

        signal_hook::flag::register_usize(libc::SIGCHLD, Arc::clone(&sigchld_flag), libc::SIGCHLD as usize)
            .map_err(io::Error::other)?;
        signal_hook::flag::register_usize(urgent_signo, Arc::clone(&urgent_flag), urgent_signo as usize)
            .map_err(io::Error::other)?;

        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            sigchld_flag,
            urgent_flag,
            urgent_signo,
        })
    }

    pub fn urgent_signal(&self) -> i32 {
        self.urgent_signo
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn register(
        &self,
        source: &mut impl event::Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest.into())
    }

    pub fn deregister(&self, source: &mut impl event::Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Re-creates the underlying `mio::Poll` instance. A forked child must
    /// call this before registering its own endpoints: the inherited `Poll`
    /// fd still refers to the parent's registrations and would otherwise
    /// duplicate callbacks for fds the child doesn't own.
    pub fn reinit(&mut self) -> io::Result<()> {
        self.poll = Poll::new()?;
        Ok(())
    }

    /// Polls once and returns the fired events. A `timeout` of `None` blocks
    /// until at least one event or a signal interrupts the wait;
    /// `Some(Duration::ZERO)` is the non-blocking variant.
    pub fn poll_events(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Blocks until at least one I/O event fires or a signal interrupts the
    /// wait.
    pub fn loop_once(&mut self) -> io::Result<()> {
        self.poll_events(None)
    }

    /// Polls without blocking.
    pub fn loop_nonblocking(&mut self) -> io::Result<()> {
        self.poll_events(Some(Duration::ZERO))
    }

    /// Drains and clears the SIGCHLD flag; `true` if a signal arrived since
    /// the last call.
    pub fn take_sigchld(&self) -> bool {
        self.sigchld_flag.swap(0, Ordering::AcqRel) != 0
    }

    /// Drains and clears the urgent-signal flag.
    pub fn take_urgent(&self) -> bool {
        self.urgent_flag.swap(0, Ordering::AcqRel) != 0
    }
}
