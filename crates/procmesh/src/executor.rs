use std::collections::HashMap;
use std::io;
use std::os::fd::FromRawFd;
use std::time::{Duration, Instant};

use mio::net::UnixStream;
use procmesh_network::Reactor;
use tracing::warn;

use crate::config::{ExecutorConfig, RouterConfig};
use crate::error::ExecutorError;
use crate::listener::Listener;
use crate::router::{Router, ServiceOutcome, Target};

/// How a reaped child process ended, as observed via `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    Living,
    Exited(i32),
    Signaled(i32),
}

#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub pid: u32,
    pub started_at: Instant,
    pub termination: TerminationType,
}

impl ChildInfo {
    pub fn uptime(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }

    pub fn is_living(&self) -> bool {
        self.termination == TerminationType::Living
    }
}

/// Drives the fork/reactor loop for one process in the tree. Owns the
/// [`Router`] and the per-process child table.
pub struct Executor {
    router: Router,
    reactor: Reactor,
    config: ExecutorConfig,
    children: HashMap<u32, ChildInfo>,
    shutdown_requested: bool,
    is_root: bool,
}

impl Executor {
    /// Builds the root executor for a process tree. `alias` is this
    /// process's own alias, used as an alias-routing destination.
    pub fn new(alias: Option<String>, router_config: RouterConfig, config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let reactor = Reactor::new(router_config.urgent_signal).map_err(ExecutorError::Reactor)?;
        let pid = std::process::id();
        let router = Router::new(pid, alias, router_config);
        Ok(Self { router, reactor, config, children: HashMap::new(), shutdown_requested: false, is_root: true })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn add_listener(&mut self, listener: Box<dyn Listener>) {
        self.router.add_listener(listener);
    }

    /// Every child entry still present, in no particular order. An entry
    /// stays here — alive or not — until [`Executor::read_child_state`]
    /// acknowledges it.
    pub fn children(&self) -> impl Iterator<Item = (u32, ChildInfo)> + '_ {
        self.children.iter().map(|(&pid, info)| (pid, info.clone()))
    }

    pub fn child(&self, pid: u32) -> Option<&ChildInfo> {
        self.children.get(&pid)
    }

    /// Acknowledges and removes a child's entry, returning its last known
    /// state. Once acknowledged, the child no longer counts toward
    /// `WAIT_FOR_PEERS_TERMINATION`'s shutdown condition even if it's still
    /// alive — acknowledging a living child is the caller's responsibility
    /// to get right, the same way `waitpid` is.
    pub fn read_child_state(&mut self, pid: u32) -> Option<ChildInfo> {
        self.children.remove(&pid)
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested
    }

    /// Convenience wrapper over `Router::submit` that supplies this
    /// executor's own reactor registry.
    pub fn submit(
        &mut self,
        payload: Vec<u8>,
        dst: Target,
        serialize: bool,
        request_ack: bool,
        broadcast: bool,
        urgent: bool,
    ) -> Result<u32, ExecutorError> {
        self.router
            .submit(payload, dst, serialize, request_ack, broadcast, urgent, self.reactor.registry())
            .map_err(ExecutorError::from)
    }

    /// Forks a child connected to this process by a fresh, non-blocking
    /// socket pair. `parent_cb` runs in the parent right after fork with
    /// `(executor, child_pid)` and returns normally. `child_cb` runs in
    /// the child before it enters its own event loop; the child never
    /// returns from this call.
    pub fn fork(
        &mut self,
        child_alias: Option<String>,
        parent_cb: impl FnOnce(&mut Executor, u32),
        child_cb: impl FnOnce(&mut Executor),
    ) -> Result<u32, ExecutorError> {
        let mut fds = [0; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(ExecutorError::SocketPair(io::Error::last_os_error()));
        }
        let (parent_fd, child_fd) = (fds[0], fds[1]);
        unsafe {
            libc::fcntl(parent_fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(child_fd, libc::F_SETFL, libc::O_NONBLOCK);
        }

        let fork_ret = unsafe { libc::fork() };
        if fork_ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(parent_fd);
                libc::close(child_fd);
            }
            return Err(ExecutorError::Fork(err));
        }

        if fork_ret == 0 {
            unsafe { libc::close(parent_fd) };
            self.become_child(child_alias, child_fd, child_cb);
        }

        unsafe { libc::close(child_fd) };
        let parent_stream = unsafe { UnixStream::from_raw_fd(parent_fd) };
        let child_pid = fork_ret as u32;
        self.router
            .add_endpoint(child_pid, parent_stream, self.reactor.registry())
            .map_err(|source| ExecutorError::Router(crate::error::RouterError::Io { pid: child_pid, source }))?;
        if let Some(alias) = &child_alias {
            self.router.register_neighbour_alias(child_pid, alias);
        }
        self.children.insert(
            child_pid,
            ChildInfo { pid: child_pid, started_at: Instant::now(), termination: TerminationType::Living },
        );
        parent_cb(self, child_pid);
        Ok(child_pid)
    }

    /// Reinitialises `self` for the child branch of a fork and runs the
    /// rest of the child's lifetime. Never returns: the process exits from
    /// inside this function.
    fn become_child(&mut self, alias: Option<String>, child_fd: i32, child_cb: impl FnOnce(&mut Executor)) -> ! {
        if let Err(err) = self.reactor.reinit() {
            procmesh_utils::safe_panic!("reactor reinit failed in forked child: {err}");
        }

        let listeners = self.router.take_listeners();
        let config = self.router.config().clone();
        let own_pid = std::process::id();
        self.router = Router::new(own_pid, alias, config);
        self.router.set_listeners(listeners);
        self.is_root = false;
        self.children.clear();

        let parent_pid = unsafe { libc::getppid() } as u32;
        let child_stream = unsafe { UnixStream::from_raw_fd(child_fd) };
        if let Err(err) = self.router.add_endpoint(parent_pid, child_stream, self.reactor.registry()) {
            procmesh_utils::safe_panic!("failed to register parent endpoint in child: {err}");
        }

        child_cb(self);

        self.router.dispatch_start();
        self.run_loop();
        self.finish_shutdown();
        std::process::exit(self.config.non_root_exit_code);
    }

    /// Runs the root's event loop. Returns once shutdown has fully
    /// completed; the root exits the process only if `exitAfterShutdown`
    /// (`ExecutorConfig::exit_after_shutdown`) is set.
    pub fn run(&mut self) {
        self.router.dispatch_start();
        self.run_loop();
        self.finish_shutdown();
        if self.is_root && self.config.exit_after_shutdown {
            std::process::exit(0);
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown_requested = true;
        self.router.dispatch_shutdown();
    }

    fn should_continue(&self, ttl_spins: &mut u32) -> bool {
        if !self.shutdown_requested {
            return true;
        }

        let flags = self.config.shutdown_flags;
        let flush_pending = flags.flush_pending_messages && self.router.pending() > 0;
        // Per the spec, this waits for every child *state* to be consumed
        // via `read_child_state`, not for every child to literally still be
        // alive — a reaped child whose exit the caller never acknowledged
        // still blocks shutdown.
        let wait_for_peers = flags.wait_for_peers_termination && !self.children.is_empty();

        if flush_pending || wait_for_peers {
            *ttl_spins += 1;
            if *ttl_spins >= self.config.shutdown_ttl {
                warn!(ttl = self.config.shutdown_ttl, "shutdown TTL exceeded, exiting anyway");
                return false;
            }
            return true;
        }

        false
    }

    fn run_loop(&mut self) {
        let mut ttl_spins = 0u32;
        while self.should_continue(&mut ttl_spins) {
            // Block indefinitely in steady state; once shutdown is underway
            // poll on a short timeout instead, so the TTL spin cap actually
            // bounds wall-clock time even if nothing else ever wakes the
            // reactor (e.g. a child that never exits and never talks to us).
            let timeout = if self.shutdown_requested { Some(Duration::from_millis(10)) } else { None };
            if let Err(err) = self.poll_and_service(timeout) {
                warn!(?err, "reactor poll failed");
            }
        }

        self.router.dispatch_exit_loop();
    }

    /// Polls once (non-blocking) and services whatever fired. Lower-level
    /// than `run`: useful for embedding the executor inside a loop the
    /// caller already controls, or from tests that need fine-grained
    /// control over how many iterations run.
    pub fn step(&mut self) -> io::Result<()> {
        self.poll_and_service(Some(Duration::ZERO))
    }

    fn poll_and_service(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.reactor.poll_events(timeout)?;

        if self.reactor.take_sigchld() {
            self.reap_children();
        }
        if self.reactor.take_urgent() {
            self.router.drain_urgent(self.reactor.registry());
        }

        let ready: Vec<(mio::Token, bool, bool)> =
            self.reactor.events().iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
        for (token, readable, writable) in ready {
            let _: ServiceOutcome = self.router.service_endpoint(token, readable, writable, self.reactor.registry());
        }

        Ok(())
    }

    /// `waitpid(-1, WNOHANG)` in a loop, updating `ChildInfo` for each
    /// reaped pid. Socket teardown for a reaped child is left to the
    /// router's own EOF path rather than duplicated here, so there is a
    /// single place that closes an endpoint and fires `onPeerShutdown`.
    fn reap_children(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            let pid = pid as u32;
            let termination = if libc::WIFEXITED(status) {
                TerminationType::Exited(libc::WEXITSTATUS(status))
            } else if libc::WIFSIGNALED(status) {
                TerminationType::Signaled(libc::WTERMSIG(status))
            } else {
                continue;
            };
            if let Some(info) = self.children.get_mut(&pid) {
                info.termination = termination;
            }
        }
    }

    /// Blocking reap of any children still alive after the loop exits, per
    /// the spec's `gracefulShutdown` step.
    fn finish_shutdown(&mut self) {
        for info in self.children.values() {
            if !info.is_living() {
                continue;
            }
            let mut status: libc::c_int = 0;
            unsafe {
                libc::waitpid(info.pid as libc::pid_t, &mut status, 0);
            }
        }
    }
}
