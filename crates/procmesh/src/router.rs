use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use mio::{Registry, Token, net::UnixStream};
use procmesh_network::{ConnState, DequeuePosition, DstRemote, Endpoint, Frame, IoDirection, UnsentFrame};

use crate::config::{DispatchMode, RouterConfig};
use crate::error::{Op, RouterError};
use crate::listener::{Listener, MessageEvent};

/// Destination of a local submission: either a known direct-neighbour pid
/// or an alias resolved by flooding.
#[derive(Debug, Clone)]
pub enum Target {
    Pid(u32),
    Alias(String),
}

#[derive(Clone, Copy)]
enum DispatchKind {
    Sent,
    Received,
    Interrupted,
}

/// How many neighbour-hops a locally originated frame has been flushed
/// over. Removed once `sent` reaches `target`; `onMessageSent` fires on the
/// 0→1 transition only.
struct EmissionCounter {
    sent: u32,
    target: u32,
}

/// Outcome of servicing one readiness event against a single endpoint.
pub enum ServiceOutcome {
    Alive,
    Disconnected { pid: u32, unsent: Vec<UnsentFrame> },
}

/// Owns every per-neighbour endpoint for this process and implements flood
/// routing with split-horizon, ack generation, broadcast fan-out, and
/// listener dispatch.
pub struct Router {
    pid: u32,
    alias: Option<String>,
    config: RouterConfig,
    endpoints: HashMap<u32, Endpoint>,
    listeners: Vec<Box<dyn Listener>>,
    emission: HashMap<u32, EmissionCounter>,
    neighbour_aliases: HashMap<u32, String>,
    interrupted: bool,
    next_token: usize,
}

impl Router {
    pub fn new(pid: u32, alias: Option<String>, config: RouterConfig) -> Self {
        Self {
            pid,
            alias,
            config,
            endpoints: HashMap::new(),
            listeners: Vec::new(),
            emission: HashMap::new(),
            neighbour_aliases: HashMap::new(),
            interrupted: false,
            next_token: 1,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn neighbour_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Total frames still queued across every endpoint, used by the
    /// executor's shutdown loop condition.
    pub fn pending(&self) -> usize {
        self.endpoints.values().map(Endpoint::queued_frames).sum()
    }

    /// Inserted in priority order; equal priorities keep registration order.
    pub fn add_listener(&mut self, listener: Box<dyn Listener>) {
        let priority = listener.priority();
        let pos = self.listeners.iter().position(|l| l.priority() > priority).unwrap_or(self.listeners.len());
        self.listeners.insert(pos, listener);
    }

    pub fn add_endpoint(&mut self, pid: u32, stream: UnixStream, registry: &Registry) -> std::io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let mut endpoint = Endpoint::new(stream, pid, token);
        endpoint.register(registry)?;
        self.endpoints.insert(pid, endpoint);
        Ok(())
    }

    /// Removes the endpoint and returns whatever was still queued for it.
    /// Does not fire `onPeerShutdown` — callers that need the listener
    /// notification should use [`Router::service_endpoint`], which fires it
    /// itself on EOF.
    pub fn remove_endpoint(&mut self, pid: u32, registry: &Registry) -> Option<Vec<UnsentFrame>> {
        let mut endpoint = self.endpoints.remove(&pid)?;
        self.neighbour_aliases.remove(&pid);
        let unsent = endpoint.take_unsent();
        endpoint.close(registry);
        Some(unsent)
    }

    /// Registers `pid`'s alias for collision detection against this
    /// process's own alias and every other direct neighbour's. A collision
    /// is non-fatal — the alias simply isn't recorded for `pid` and a
    /// `RouterError::AliasCollision` is reported through `onRouterError` so
    /// listeners can see it — since aliases are a convenience addressing
    /// layer, not a namespace the router enforces uniqueness on.
    pub fn register_neighbour_alias(&mut self, pid: u32, alias: &str) {
        let holder = if self.alias.as_deref() == Some(alias) {
            Some(self.pid)
        } else {
            self.neighbour_aliases.iter().find(|(_, a)| a.as_str() == alias).map(|(&other_pid, _)| other_pid)
        };

        if let Some(holder) = holder {
            let err = RouterError::AliasCollision { alias: alias.to_string(), holder };
            self.report_error(Op::Alias, None, &err.to_string());
            return;
        }

        self.neighbour_aliases.insert(pid, alias.to_string());
    }

    pub fn token_for(&self, pid: u32) -> Option<Token> {
        self.endpoints.get(&pid).map(Endpoint::token)
    }

    fn endpoint_for_token(&self, token: Token) -> Option<u32> {
        self.endpoints.iter().find(|(_, e)| e.token() == token).map(|(pid, _)| *pid)
    }

    /// Local submission entry point. Returns the freshly assigned message
    /// id on success.
    pub fn submit(
        &mut self,
        payload: Vec<u8>,
        dst: Target,
        serialize: bool,
        request_ack: bool,
        broadcast: bool,
        urgent: bool,
        registry: &Registry,
    ) -> Result<u32, RouterError> {
        if let Target::Pid(pid) = &dst {
            if *pid == self.pid {
                return Err(RouterError::Loopback(*pid));
            }
        }

        let id: u32 = rand::random();
        let dst_remote = if broadcast {
            DstRemote::Broadcast
        } else {
            match &dst {
                Target::Alias(_) => DstRemote::Alias,
                Target::Pid(pid) => DstRemote::Pid(*pid),
            }
        };
        let alias = match &dst {
            Target::Alias(alias) => alias.clone(),
            Target::Pid(_) => String::new(),
        };

        let base = Frame {
            dst: 0,
            src: self.pid,
            serialize,
            request_ack,
            is_ack: false,
            id,
            urgent,
            dst_remote,
            last_node_pid: self.pid,
            broadcast,
            alias,
            payload,
        };

        let direct_pid = match &dst {
            Target::Pid(pid) if self.endpoints.contains_key(pid) => Some(*pid),
            _ => None,
        };

        let targets: Vec<u32> = if broadcast || direct_pid.is_none() {
            self.endpoints.keys().copied().collect()
        } else {
            vec![direct_pid.unwrap()]
        };

        if targets.is_empty() {
            self.fire_sent_immediately(&base);
            return Ok(id);
        }

        for pid in &targets {
            let frame = base.for_next_hop(*pid, self.pid);
            if let Some(endpoint) = self.endpoints.get_mut(pid) {
                endpoint.enqueue(frame, registry, DequeuePosition::Back).map_err(|source| RouterError::Io { pid: *pid, source })?;
            }
        }

        self.emission.insert(id, EmissionCounter { sent: 0, target: targets.len() as u32 });
        Ok(id)
    }

    /// Services one readiness event against the endpoint it targets,
    /// processing whatever frames were received or flushed as a result.
    ///
    /// Frame buffers are collected locally while the endpoint's own
    /// `&mut` borrow is alive, then processed afterwards so the rest of
    /// `self` (other endpoints, listeners) stays available to the handlers.
    pub fn service_endpoint(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        registry: &Registry,
    ) -> ServiceOutcome {
        let Some(pid) = self.endpoint_for_token(token) else {
            return ServiceOutcome::Alive;
        };

        let mut received = Vec::new();
        let mut flushed = Vec::new();
        let mut errors = Vec::new();
        let conn_state = match self.endpoints.get_mut(&pid) {
            Some(endpoint) => endpoint.poll_with(
                registry,
                readable,
                writable,
                &mut |frame| received.push(frame),
                &mut |frame| flushed.push(frame),
                &mut |direction, err| errors.push((direction, err)),
            ),
            None => return ServiceOutcome::Alive,
        };

        for frame in received {
            self.handle_received_frame(pid, frame, registry);
        }
        for frame in flushed {
            self.handle_flushed_frame(frame);
        }
        for (direction, err) in errors {
            let op = match direction {
                IoDirection::Read => Op::Recv,
                IoDirection::Write => Op::Send,
            };
            self.report_error(op, err.raw_os_error(), &err.to_string());
        }

        if conn_state == ConnState::Disconnected {
            if let Some(unsent) = self.remove_endpoint(pid, registry) {
                self.dispatch_peer_shutdown(pid, &unsent);
                return ServiceOutcome::Disconnected { pid, unsent };
            }
        }

        ServiceOutcome::Alive
    }

    /// Synchronous read-only drain run from the urgent-signal path. Re-entry
    /// while already interrupted is a caller bug, not a recoverable error.
    pub fn drain_urgent(&mut self, registry: &Registry) {
        if self.interrupted {
            procmesh_utils::safe_panic!("urgent delivery re-entered while already interrupted");
            return;
        }
        self.interrupted = true;

        let pids: Vec<u32> = self.endpoints.keys().copied().collect();
        for pid in pids {
            let mut received = Vec::new();
            let mut errors = Vec::new();
            if let Some(endpoint) = self.endpoints.get_mut(&pid) {
                endpoint.drain_urgent(&mut |frame| received.push(frame), &mut |_direction, err| errors.push(err));
            }
            for frame in received {
                self.handle_received_frame(pid, frame, registry);
            }
            for err in errors {
                self.report_error(Op::Recv, err.raw_os_error(), &err.to_string());
            }
        }

        self.interrupted = false;
    }

    fn handle_received_frame(&mut self, from_pid: u32, frame: Frame, registry: &Registry) {
        let targeted = match frame.dst_remote {
            DstRemote::Pid(pid) => pid == self.pid,
            DstRemote::Alias => self.alias.as_deref() == Some(frame.alias.as_str()),
            DstRemote::Broadcast => false,
        };
        let is_broadcast = matches!(frame.dst_remote, DstRemote::Broadcast);

        if !targeted || is_broadcast {
            self.forward(from_pid, &frame, registry);

            if !is_broadcast && !targeted {
                if self.config.dispatch_mode == DispatchMode::Raw {
                    self.deliver(from_pid, &frame);
                }
                return;
            }
        }

        if targeted && frame.request_ack && !frame.is_ack {
            self.send_ack(from_pid, &frame, registry);
        }

        self.deliver(from_pid, &frame);
    }

    fn forward(&mut self, from_pid: u32, frame: &Frame, registry: &Registry) {
        let targets: Vec<u32> = self.endpoints.keys().copied().filter(|&pid| pid != from_pid).collect();
        for pid in targets {
            let forwarded = frame.for_next_hop(pid, self.pid);
            if let Some(endpoint) = self.endpoints.get_mut(&pid) {
                if let Err(source) = endpoint.enqueue(forwarded, registry, DequeuePosition::Back) {
                    let errno = source.raw_os_error();
                    self.report_error(Op::Send, errno, &source.to_string());
                }
            }
        }
    }

    fn send_ack(&mut self, to_pid: u32, frame: &Frame, registry: &Registry) {
        let ack = Frame {
            dst: to_pid,
            src: self.pid,
            serialize: false,
            request_ack: false,
            is_ack: true,
            id: frame.id,
            urgent: false,
            dst_remote: DstRemote::Pid(frame.src),
            last_node_pid: self.pid,
            broadcast: false,
            alias: String::new(),
            payload: b"1".to_vec(),
        };
        if let Some(endpoint) = self.endpoints.get_mut(&to_pid) {
            if let Err(source) = endpoint.enqueue(ack, registry, DequeuePosition::Back) {
                let errno = source.raw_os_error();
                self.report_error(Op::Send, errno, &source.to_string());
            }
        }
    }

    fn deliver(&mut self, from_pid: u32, frame: &Frame) {
        let dst = match frame.dst_remote {
            DstRemote::Broadcast => 0,
            DstRemote::Alias => self.pid,
            DstRemote::Pid(pid) => pid,
        };
        let fd = self.endpoints.get(&from_pid).map(Endpoint::raw_fd).unwrap_or(-1);
        let mut event = MessageEvent {
            id: frame.id,
            src: frame.src,
            dst,
            fd,
            is_urgent: frame.urgent,
            is_ack: frame.is_ack,
            is_broadcast: matches!(frame.dst_remote, DstRemote::Broadcast),
            payload: frame.payload.clone(),
        };
        let kind = if self.interrupted { DispatchKind::Interrupted } else { DispatchKind::Received };
        self.dispatch_message(kind, &mut event);
    }

    fn handle_flushed_frame(&mut self, frame: Frame) {
        if frame.urgent {
            self.signal_next_hop(frame.dst);
        }
        if frame.src != self.pid {
            return;
        }

        let fire = match self.config.dispatch_mode {
            DispatchMode::Raw => true,
            DispatchMode::Process => self.consume_emission_counter(frame.id),
        };
        if !fire {
            return;
        }

        let fd = self.endpoints.get(&frame.dst).map(Endpoint::raw_fd).unwrap_or(-1);
        let mut event = MessageEvent {
            id: frame.id,
            src: frame.src,
            dst: if frame.broadcast { 0 } else { frame.dst },
            fd,
            is_urgent: frame.urgent,
            is_ack: frame.is_ack,
            is_broadcast: frame.broadcast,
            payload: frame.payload,
        };
        self.dispatch_message(DispatchKind::Sent, &mut event);
    }

    fn fire_sent_immediately(&mut self, frame: &Frame) {
        let mut event = MessageEvent {
            id: frame.id,
            src: frame.src,
            dst: if frame.broadcast { 0 } else { frame.dst },
            fd: -1,
            is_urgent: frame.urgent,
            is_ack: frame.is_ack,
            is_broadcast: frame.broadcast,
            payload: frame.payload.clone(),
        };
        self.dispatch_message(DispatchKind::Sent, &mut event);
    }

    fn consume_emission_counter(&mut self, id: u32) -> bool {
        let Some(counter) = self.emission.get_mut(&id) else { return false };
        counter.sent += 1;
        let first = counter.sent == 1;
        if counter.sent >= counter.target {
            self.emission.remove(&id);
        }
        first
    }

    fn signal_next_hop(&self, pid: u32) {
        unsafe {
            libc::kill(pid as libc::pid_t, self.config.urgent_signal);
        }
    }

    fn dispatch_message(&mut self, kind: DispatchKind, event: &mut MessageEvent) {
        let op = match kind {
            DispatchKind::Sent => Op::Send,
            DispatchKind::Received | DispatchKind::Interrupted => Op::Recv,
        };

        let mut listeners = std::mem::take(&mut self.listeners);
        let mut panics = Vec::new();
        for listener in &mut listeners {
            let result = panic::catch_unwind(AssertUnwindSafe(|| match kind {
                DispatchKind::Sent => listener.on_message_sent(event),
                DispatchKind::Received => listener.on_message_received(event),
                DispatchKind::Interrupted => listener.on_interrupt_receive(event),
            }));
            if let Err(payload) = result {
                panics.push(panic_message(&payload));
            }
        }
        self.listeners = listeners;

        for message in panics {
            self.report_error(op, None, &message);
        }
    }

    fn dispatch_peer_shutdown(&mut self, pid: u32, unsent: &[UnsentFrame]) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| listener.on_peer_shutdown(pid, unsent)));
        }
        self.listeners = listeners;
    }

    fn report_error(&mut self, op: Op, errno: Option<i32>, message: &str) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| listener.on_router_error(op, errno, message)));
        }
        self.listeners = listeners;
    }

    pub fn dispatch_start(&mut self) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| listener.on_start()));
        }
        self.listeners = listeners;
    }

    pub fn dispatch_shutdown(&mut self) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| listener.on_shutdown()));
        }
        self.listeners = listeners;
    }

    pub fn dispatch_exit_loop(&mut self) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| listener.on_exit_loop()));
        }
        self.listeners = listeners;
    }

    pub fn into_listeners(self) -> Vec<Box<dyn Listener>> {
        self.listeners
    }

    pub fn take_listeners(&mut self) -> Vec<Box<dyn Listener>> {
        std::mem::take(&mut self.listeners)
    }

    pub fn set_listeners(&mut self, listeners: Vec<Box<dyn Listener>>) {
        self.listeners = listeners;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::config::RouterConfig;

    struct ErrorRecorder(Rc<RefCell<Vec<String>>>);

    impl Listener for ErrorRecorder {
        fn on_router_error(&mut self, _op: Op, _errno: Option<i32>, message: &str) {
            self.0.borrow_mut().push(message.to_string());
        }
    }

    #[test]
    fn alias_collision_between_two_neighbours_is_reported_non_fatally() {
        let mut router = Router::new(1, Some("self".to_string()), RouterConfig::default());
        let errors = Rc::new(RefCell::new(Vec::new()));
        router.add_listener(Box::new(ErrorRecorder(Rc::clone(&errors))));

        router.register_neighbour_alias(2, "worker");
        router.register_neighbour_alias(3, "worker");

        assert_eq!(errors.borrow().len(), 1);
        assert!(errors.borrow()[0].contains("worker"));
        assert_eq!(router.neighbour_aliases.get(&2).map(String::as_str), Some("worker"));
        assert_eq!(router.neighbour_aliases.get(&3), None, "the colliding alias must not be recorded");
    }

    #[test]
    fn alias_collision_with_this_process_own_alias_is_reported() {
        let mut router = Router::new(1, Some("self".to_string()), RouterConfig::default());
        let errors = Rc::new(RefCell::new(Vec::new()));
        router.add_listener(Box::new(ErrorRecorder(Rc::clone(&errors))));

        router.register_neighbour_alias(2, "self");

        assert_eq!(errors.borrow().len(), 1);
        assert_eq!(router.neighbour_aliases.get(&2), None);
    }
}
