use procmesh_network::UnsentFrame;

use crate::error::Op;

/// Read-only (except `payload`) view of a message as it crosses a listener
/// callback. `dst` is the semantic destination: `0` for broadcast, the local
/// pid otherwise. Back-references to the router/executor are deliberately
/// not embedded here — callbacks receive them as ordinary arguments instead,
/// which sidesteps the self-referential-struct problem a dictionary-style
/// event object would otherwise have.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub id: u32,
    pub src: u32,
    pub dst: u32,
    pub fd: i32,
    pub is_urgent: bool,
    pub is_ack: bool,
    pub is_broadcast: bool,
    pub payload: Vec<u8>,
}

/// Priority-ordered callback set. Lower `priority()` fires first; listeners
/// with equal priority fire in registration order. All methods default to a
/// no-op so implementers only override what they use.
pub trait Listener {
    fn priority(&self) -> i32 {
        0
    }

    fn on_message_sent(&mut self, _event: &mut MessageEvent) {}
    fn on_message_received(&mut self, _event: &mut MessageEvent) {}
    fn on_interrupt_receive(&mut self, _event: &mut MessageEvent) {}
    fn on_peer_shutdown(&mut self, pid: u32, unsent: &[UnsentFrame]) {
        let _ = (pid, unsent);
    }
    fn on_router_error(&mut self, op: Op, errno: Option<i32>, message: &str) {
        let _ = (op, errno, message);
    }

    fn on_start(&mut self) {}
    fn on_shutdown(&mut self) {}
    fn on_exit_loop(&mut self) {}
}
