//! End-to-end tests over real `fork()`ed process trees: no mocked OS
//! primitives, just socketpairs and signals exactly as production code sees
//! them. Each scenario mirrors one of the concrete topologies the routing
//! algorithm is built around.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use procmesh::{Executor, ExecutorConfig, Listener, MessageEvent, Op, RouterConfig, Target};

fn write_marker(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).expect("write result marker");
}

/// Drives `executor`'s reactor for up to `duration`, ignoring whatever
/// happens. Used inside forked children that just need to keep servicing
/// their sockets for the lifetime of the test.
fn pump(executor: &mut Executor, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        let _ = executor.step();
        thread::sleep(Duration::from_millis(2));
    }
}

/// Drives `executor` until `done` returns true or `timeout` elapses.
fn pump_until(executor: &mut Executor, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let _ = executor.step();
        if done() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct Recorder {
    sent: Vec<MessageEvent>,
    received: Vec<MessageEvent>,
    peer_shutdowns: Vec<(u32, usize)>,
}

struct RecorderListener(Rc<RefCell<Recorder>>);

impl Listener for RecorderListener {
    fn on_message_sent(&mut self, event: &mut MessageEvent) {
        self.0.borrow_mut().sent.push(event.clone());
    }

    fn on_message_received(&mut self, event: &mut MessageEvent) {
        self.0.borrow_mut().received.push(event.clone());
    }

    fn on_peer_shutdown(&mut self, pid: u32, unsent: &[procmesh::network::UnsentFrame]) {
        self.0.borrow_mut().peer_shutdowns.push((pid, unsent.len()));
    }

    fn on_router_error(&mut self, _op: Op, _errno: Option<i32>, message: &str) {
        panic!("unexpected router error: {message}");
    }
}

/// Line topology: root R — B — C, with C given the alias `"worker"`. R
/// submits by alias; B has no listener of its own, so delivery to C only
/// happens if split-horizon forwarding works with zero application code.
#[test]
fn line_topology_relay_delivers_to_tail_by_alias() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dir_path = dir.path().to_path_buf();

    let mut root = Executor::new(None, RouterConfig::default(), ExecutorConfig::default()).expect("root executor");

    let b_dir = dir_path.clone();
    root.fork(
        None,
        |_executor, _b_pid| {},
        move |b_executor| {
            let c_dir = b_dir.clone();
            b_executor
                .fork(
                    Some("worker".to_string()),
                    |_executor, _c_pid| {},
                    move |c_executor| {
                        struct TailListener(PathBuf);
                        impl Listener for TailListener {
                            fn on_message_received(&mut self, event: &mut MessageEvent) {
                                write_marker(&self.0, "tail.txt", &String::from_utf8_lossy(&event.payload));
                            }
                        }
                        c_executor.add_listener(Box::new(TailListener(c_dir.clone())));
                        pump(c_executor, Duration::from_secs(2));
                        std::process::exit(0);
                    },
                )
                .expect("fork C");
            pump(b_executor, Duration::from_secs(2));
            std::process::exit(0);
        },
    )
    .expect("fork B");

    root.submit(b"relay-message".to_vec(), Target::Alias("worker".to_string()), true, false, false, false)
        .expect("submit by alias");

    let marker = dir_path.join("tail.txt");
    pump_until(&mut root, Duration::from_secs(3), || marker.exists());

    let content = fs::read_to_string(&marker).expect("C received the relayed message");
    assert_eq!(content, "relay-message");
}

/// Star topology: root R with children X, Y, Z. A broadcast submission must
/// reach each leaf exactly once, and `onMessageSent` must fire exactly once
/// on R despite fanning out to three neighbours.
#[test]
fn star_topology_broadcast_reaches_every_leaf_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dir_path = dir.path().to_path_buf();

    let mut root = Executor::new(None, RouterConfig::default(), ExecutorConfig::default()).expect("root executor");
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    root.add_listener(Box::new(RecorderListener(Rc::clone(&recorder))));

    for leaf in ["x", "y", "z"] {
        let leaf_dir = dir_path.clone();
        let marker_name = format!("{leaf}.txt");
        root.fork(
            None,
            |_executor, _pid| {},
            move |leaf_executor| {
                struct LeafListener(PathBuf, String);
                impl Listener for LeafListener {
                    fn on_message_received(&mut self, event: &mut MessageEvent) {
                        let content = format!(
                            "{}|broadcast={}|dst={}",
                            String::from_utf8_lossy(&event.payload),
                            event.is_broadcast,
                            event.dst
                        );
                        write_marker(&self.0, &self.1, &content);
                    }
                }
                leaf_executor.add_listener(Box::new(LeafListener(leaf_dir.clone(), marker_name.clone())));
                pump(leaf_executor, Duration::from_secs(2));
                std::process::exit(0);
            },
        )
        .unwrap_or_else(|err| panic!("fork {leaf}: {err}"));
    }

    root.submit(b"bcast".to_vec(), Target::Pid(0), true, false, true, false).expect("submit broadcast");

    let markers: Vec<PathBuf> = ["x", "y", "z"].iter().map(|l| dir_path.join(format!("{l}.txt"))).collect();
    pump_until(&mut root, Duration::from_secs(3), || markers.iter().all(|m| m.exists()));

    for marker in &markers {
        let content = fs::read_to_string(marker).expect("leaf marker written");
        assert_eq!(content, "bcast|broadcast=true|dst=0");
    }

    assert_eq!(recorder.borrow().sent.len(), 1, "onMessageSent must fire exactly once for the broadcast");
}

/// Direct A–B ack round trip: A submits with `request_ack`, expects
/// `onMessageSent` once followed by an ack `onMessageReceived`; B sees the
/// original frame with `is_ack = false`.
#[test]
fn ack_round_trip_between_two_processes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dir_path = dir.path().to_path_buf();
    let b_dir = dir_path.clone();

    let mut root = Executor::new(None, RouterConfig::default(), ExecutorConfig::default()).expect("root executor");
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    root.add_listener(Box::new(RecorderListener(Rc::clone(&recorder))));

    let b_pid = root
        .fork(
            None,
            |_executor, _pid| {},
            move |b_executor| {
                struct BListener(PathBuf);
                impl Listener for BListener {
                    fn on_message_received(&mut self, event: &mut MessageEvent) {
                        let content = format!(
                            "{}|is_ack={}|id={}",
                            String::from_utf8_lossy(&event.payload),
                            event.is_ack,
                            event.id
                        );
                        write_marker(&self.0, "b.txt", &content);
                    }
                }
                b_executor.add_listener(Box::new(BListener(b_dir.clone())));
                pump(b_executor, Duration::from_secs(2));
                std::process::exit(0);
            },
        )
        .expect("fork B");

    let id = root.submit(b"q".to_vec(), Target::Pid(b_pid), true, true, false, false).expect("submit with ack");

    pump_until(&mut root, Duration::from_secs(3), || recorder.borrow().received.iter().any(|e| e.id == id));

    {
        let rec = recorder.borrow();
        assert_eq!(rec.sent.len(), 1);
        assert_eq!(rec.sent[0].id, id);
        let ack = rec.received.iter().find(|e| e.id == id).expect("ack delivered to A");
        assert!(ack.is_ack);
        assert_eq!(ack.payload, b"1");
    }

    let b_marker = fs::read_to_string(dir_path.join("b.txt")).expect("B observed the original frame");
    assert_eq!(b_marker, format!("q|is_ack=false|id={id}"));
}

/// Depth-2 alias routing with a sibling: R has children B and D; B has
/// child C aliased `"worker"`. R submits to the alias. Only C may deliver
/// locally; B only forwards, D is not on the path to C at all and must not
/// deliver either.
#[test]
fn alias_routing_depth_two_with_sibling_filters_by_alias() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dir_path = dir.path().to_path_buf();

    let mut root = Executor::new(None, RouterConfig::default(), ExecutorConfig::default()).expect("root executor");

    let d_dir = dir_path.clone();
    root.fork(
        None,
        |_executor, _pid| {},
        move |d_executor| {
            struct DListener(PathBuf);
            impl Listener for DListener {
                fn on_message_received(&mut self, event: &mut MessageEvent) {
                    write_marker(&self.0, "d_received.txt", &String::from_utf8_lossy(&event.payload));
                }
            }
            d_executor.add_listener(Box::new(DListener(d_dir.clone())));
            pump(d_executor, Duration::from_secs(2));
            std::process::exit(0);
        },
    )
    .expect("fork D");

    let b_dir = dir_path.clone();
    root.fork(
        None,
        |_executor, _pid| {},
        move |b_executor| {
            struct BListener(PathBuf);
            impl Listener for BListener {
                fn on_message_received(&mut self, _event: &mut MessageEvent) {
                    write_marker(&self.0, "b_received.txt", "unexpected");
                }
            }
            b_executor.add_listener(Box::new(BListener(b_dir.clone())));

            let c_dir = b_dir.clone();
            b_executor
                .fork(
                    Some("worker".to_string()),
                    |_executor, _pid| {},
                    move |c_executor| {
                        struct CListener(PathBuf);
                        impl Listener for CListener {
                            fn on_message_received(&mut self, event: &mut MessageEvent) {
                                write_marker(&self.0, "c_received.txt", &String::from_utf8_lossy(&event.payload));
                            }
                        }
                        c_executor.add_listener(Box::new(CListener(c_dir.clone())));
                        pump(c_executor, Duration::from_secs(2));
                        std::process::exit(0);
                    },
                )
                .expect("fork C");

            pump(b_executor, Duration::from_secs(2));
            std::process::exit(0);
        },
    )
    .expect("fork B");

    root.submit(b"job".to_vec(), Target::Alias("worker".to_string()), true, false, false, false)
        .expect("submit by alias");

    let c_marker = dir_path.join("c_received.txt");
    pump_until(&mut root, Duration::from_secs(3), || c_marker.exists());

    let content = fs::read_to_string(&c_marker).expect("C received the aliased job");
    assert_eq!(content, "job");
    assert!(!dir_path.join("b_received.txt").exists(), "B is not the alias target and must not deliver locally");
    assert!(!dir_path.join("d_received.txt").exists(), "D is not on the path to the alias and must not deliver");
}

/// A forks B, enqueues two frames for B, then kills B before it ever
/// services its socket. A must observe `onPeerShutdown` with both frames,
/// in enqueue order.
#[test]
fn peer_shutdown_surfaces_unsent_frames_in_enqueue_order() {
    let mut root = Executor::new(None, RouterConfig::default(), ExecutorConfig::default()).expect("root executor");
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    root.add_listener(Box::new(RecorderListener(Rc::clone(&recorder))));

    let b_pid = root
        .fork(
            None,
            |_executor, _pid| {},
            |_b_executor| {
                // Never polls its own reactor, so whatever A already wrote
                // to the kernel buffer is never drained before the kill.
                thread::sleep(Duration::from_secs(5));
                std::process::exit(0);
            },
        )
        .expect("fork B");

    // Deliberately no `root.step()` between these submits and the kill:
    // servicing the endpoint's writable interest would flush the frames
    // into the kernel buffer, at which point they're no longer "unsent"
    // from the router's point of view.
    root.submit(b"x".to_vec(), Target::Pid(b_pid), true, false, false, false).expect("submit x");
    root.submit(b"y".to_vec(), Target::Pid(b_pid), true, false, false, false).expect("submit y");

    unsafe {
        libc::kill(b_pid as libc::pid_t, libc::SIGKILL);
    }

    pump_until(&mut root, Duration::from_secs(3), || !recorder.borrow().peer_shutdowns.is_empty());

    assert_eq!(recorder.borrow().peer_shutdowns, vec![(b_pid, 2)]);

    unsafe {
        let mut status = 0;
        libc::waitpid(b_pid as libc::pid_t, &mut status, 0);
    }
}

/// A child that never exits on its own must not wedge `run()` forever: the
/// shutdown TTL cap bounds how long the loop waits on
/// `wait_for_peers_termination` once no other activity is moving it along.
#[test]
fn shutdown_ttl_cap_bounds_the_wait_for_a_stuck_child() {
    let config = ExecutorConfig::new().with_shutdown_ttl(5).with_exit_after_shutdown(false);
    let mut root = Executor::new(None, RouterConfig::default(), config).expect("root executor");

    let child_pid = root
        .fork(
            None,
            |_executor, _pid| {},
            |_child_executor| {
                thread::sleep(Duration::from_millis(200));
                std::process::exit(0);
            },
        )
        .expect("fork child");

    root.shutdown();
    assert!(root.child(child_pid).map(procmesh::ChildInfo::is_living).unwrap_or(false));

    let started = Instant::now();
    root.run();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(2), "shutdown TTL should bound the wait, took {elapsed:?}");

    unsafe {
        libc::kill(child_pid as libc::pid_t, libc::SIGKILL);
        let mut status = 0;
        libc::waitpid(child_pid as libc::pid_t, &mut status, 0);
    }
}
