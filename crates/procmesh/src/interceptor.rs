use crate::error::Op;
use crate::listener::{Listener, MessageEvent};

/// The four shapes a router-level occurrence can take, mirroring the four
/// `Listener` callbacks that carry a payload. Bodies that only need a subset
/// match on this and ignore the rest via `RouterEvent::ErrorOnly { .. }`
/// style wildcards.
pub enum RouterEvent<'a> {
    Sent(&'a mut MessageEvent),
    Received(&'a mut MessageEvent),
    Interrupted(&'a mut MessageEvent),
    ErrorOnly { op: Op, errno: Option<i32>, message: &'a str },
}

/// A single link in the chain-of-responsibility walked by `InterceptorChain`.
/// `matches` is the predicate gate; `handle` only runs for events that pass
/// it. Returning `true` from `handle` stops the walk.
pub trait Interceptor {
    fn matches(&self, event: &RouterEvent<'_>) -> bool;
    fn handle(&mut self, event: &mut RouterEvent<'_>) -> bool;
}

/// Ordered list of interceptors, walked front-to-back for every event it's
/// handed. This module only implements the contract and the walk;
/// interceptor bodies live outside this crate.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self { interceptors: Vec::new() }
    }

    pub fn push(&mut self, interceptor: Box<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Walks the chain for `event`, stopping at the first interceptor whose
    /// `handle` returns `true`. Returns whether the walk was stopped short.
    pub fn walk(&mut self, event: &mut RouterEvent<'_>) -> bool {
        for interceptor in &mut self.interceptors {
            if interceptor.matches(event) && interceptor.handle(event) {
                return true;
            }
        }
        false
    }
}

/// An `InterceptorChain` is itself a `Listener`: register it with
/// `Router::add_listener`/`Executor::add_listener` like any other listener
/// and it walks its own interceptors for every event it's handed. Runs
/// ahead of ordinary listeners by defaulting to the lowest priority.
impl Listener for InterceptorChain {
    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn on_message_sent(&mut self, event: &mut MessageEvent) {
        self.walk(&mut RouterEvent::Sent(event));
    }

    fn on_message_received(&mut self, event: &mut MessageEvent) {
        self.walk(&mut RouterEvent::Received(event));
    }

    fn on_interrupt_receive(&mut self, event: &mut MessageEvent) {
        self.walk(&mut RouterEvent::Interrupted(event));
    }

    fn on_router_error(&mut self, op: Op, errno: Option<i32>, message: &str) {
        self.walk(&mut RouterEvent::ErrorOnly { op, errno, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Refuter {
        calls: std::rc::Rc<std::cell::RefCell<u32>>,
    }

    impl Interceptor for Refuter {
        fn matches(&self, _event: &RouterEvent<'_>) -> bool {
            true
        }

        fn handle(&mut self, _event: &mut RouterEvent<'_>) -> bool {
            *self.calls.borrow_mut() += 1;
            true
        }
    }

    struct NeverReached {
        calls: std::rc::Rc<std::cell::RefCell<u32>>,
    }

    impl Interceptor for NeverReached {
        fn matches(&self, _event: &RouterEvent<'_>) -> bool {
            true
        }

        fn handle(&mut self, _event: &mut RouterEvent<'_>) -> bool {
            *self.calls.borrow_mut() += 1;
            false
        }
    }

    #[test]
    fn chain_stops_at_the_first_handler_that_claims_it() {
        let first_calls = std::rc::Rc::new(std::cell::RefCell::new(0));
        let second_calls = std::rc::Rc::new(std::cell::RefCell::new(0));

        let mut chain = InterceptorChain::new();
        chain.push(Box::new(Refuter { calls: std::rc::Rc::clone(&first_calls) }));
        chain.push(Box::new(NeverReached { calls: std::rc::Rc::clone(&second_calls) }));

        let mut event = MessageEvent {
            id: 1,
            src: 2,
            dst: 3,
            fd: -1,
            is_urgent: false,
            is_ack: false,
            is_broadcast: false,
            payload: Vec::new(),
        };
        let stopped = chain.walk(&mut RouterEvent::Received(&mut event));

        assert!(stopped);
        assert_eq!(*first_calls.borrow(), 1);
        assert_eq!(*second_calls.borrow(), 0, "second interceptor must not run once the first claims the event");
    }

    #[test]
    fn registered_as_a_listener_it_fires_on_message_received() {
        let calls = std::rc::Rc::new(std::cell::RefCell::new(0));
        let mut chain = InterceptorChain::new();
        chain.push(Box::new(Refuter { calls: std::rc::Rc::clone(&calls) }));

        let mut event = MessageEvent {
            id: 1,
            src: 2,
            dst: 3,
            fd: -1,
            is_urgent: false,
            is_ack: false,
            is_broadcast: false,
            payload: Vec::new(),
        };
        Listener::on_message_received(&mut chain, &mut event);

        assert_eq!(*calls.borrow(), 1);
    }
}
