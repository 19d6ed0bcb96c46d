/// Controls how a received frame not destined for this process is handled
/// once it has been forwarded on. `Process` mode only delivers to local
/// listeners when this node is the final destination; `Raw` mode delivers to
/// every node the frame passes through, forwarding included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Process,
    Raw,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub dispatch_mode: DispatchMode,
    pub urgent_signal: libc::c_int,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { dispatch_mode: DispatchMode::default(), urgent_signal: libc::SIGUSR1 }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn with_urgent_signal(mut self, signo: libc::c_int) -> Self {
        self.urgent_signal = signo;
        self
    }
}

/// Which graceful-shutdown phases an executor runs before exiting. Both
/// default on, matching the spec's description of the common case.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownFlags {
    pub flush_pending_messages: bool,
    pub wait_for_peers_termination: bool,
}

impl Default for ShutdownFlags {
    fn default() -> Self {
        Self { flush_pending_messages: true, wait_for_peers_termination: true }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub shutdown_flags: ShutdownFlags,
    /// Upper bound, in reactor spins, on how long graceful shutdown waits
    /// before giving up and exiting anyway.
    pub shutdown_ttl: u32,
    pub exit_after_shutdown: bool,
    pub non_root_exit_code: i32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shutdown_flags: ShutdownFlags::default(),
            shutdown_ttl: 100,
            exit_after_shutdown: true,
            non_root_exit_code: 0,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shutdown_flags(mut self, flags: ShutdownFlags) -> Self {
        self.shutdown_flags = flags;
        self
    }

    pub fn with_shutdown_ttl(mut self, ttl: u32) -> Self {
        self.shutdown_ttl = ttl;
        self
    }

    pub fn with_exit_after_shutdown(mut self, exit: bool) -> Self {
        self.exit_after_shutdown = exit;
        self
    }
}
