use std::{os::fd::FromRawFd, thread, time::Duration};

use mio::{Poll, Token, net::UnixStream};
use procmesh_network::{DequeuePosition, DstRemote, Endpoint, Frame};

fn socketpair() -> (UnixStream, UnixStream) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "socketpair failed");
    unsafe {
        libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
        libc::fcntl(fds[1], libc::F_SETFL, libc::O_NONBLOCK);
        (UnixStream::from_raw_fd(fds[0]), UnixStream::from_raw_fd(fds[1]))
    }
}

fn test_frame(payload: &[u8]) -> Frame {
    Frame {
        dst: 2,
        src: 1,
        serialize: true,
        request_ack: false,
        is_ack: false,
        id: 99,
        urgent: false,
        dst_remote: DstRemote::Pid(2),
        last_node_pid: 1,
        broadcast: false,
        alias: String::new(),
        payload: payload.to_vec(),
    }
}

#[test]
fn frame_survives_socketpair_round_trip() {
    let (a_sock, b_sock) = socketpair();

    let mut poll_a = Poll::new().unwrap();
    let mut endpoint_a = Endpoint::new(a_sock, 2, Token(0));
    endpoint_a.register(poll_a.registry()).unwrap();

    let mut poll_b = Poll::new().unwrap();
    let mut endpoint_b = Endpoint::new(b_sock, 1, Token(0));
    endpoint_b.register(poll_b.registry()).unwrap();

    endpoint_a.enqueue(test_frame(b"hello"), poll_a.registry(), DequeuePosition::Back).unwrap();

    let mut events_a = mio::Events::with_capacity(8);
    let mut flushed = None;
    for _ in 0..50 {
        poll_a.poll(&mut events_a, Some(Duration::from_millis(10))).unwrap();
        for event in events_a.iter() {
            endpoint_a.poll_with(
                poll_a.registry(),
                event.is_readable(),
                event.is_writable(),
                &mut |_frame| panic!("endpoint_a should never receive"),
                &mut |f| flushed = Some(f),
                &mut |direction, err| panic!("unexpected {direction:?} error: {err}"),
            );
        }
        if flushed.is_some() {
            break;
        }
    }
    let flushed = flushed.expect("frame flushed within timeout");
    assert_eq!(flushed.src, 1);
    assert_eq!(flushed.id, 99);

    let mut events_b = mio::Events::with_capacity(8);
    let mut received = None;
    for _ in 0..50 {
        poll_b.poll(&mut events_b, Some(Duration::from_millis(10))).unwrap();
        for event in events_b.iter() {
            endpoint_b.poll_with(
                poll_b.registry(),
                event.is_readable(),
                event.is_writable(),
                &mut |frame| received = Some(frame),
                &mut |_| panic!("endpoint_b should never flush"),
                &mut |direction, err| panic!("unexpected {direction:?} error: {err}"),
            );
        }
        if received.is_some() {
            break;
        }
    }
    let received = received.expect("frame received within timeout");
    assert_eq!(received.payload, b"hello");
    assert_eq!(received.src, 1);
    assert_eq!(received.id, 99);
}

#[test]
fn peer_eof_surfaces_unsent_frames() {
    let (a_sock, b_sock) = socketpair();
    let poll_a = Poll::new().unwrap();
    let mut endpoint_a = Endpoint::new(a_sock, 2, Token(0));
    endpoint_a.register(poll_a.registry()).unwrap();

    // fill the kernel buffer's worth of small frames so at least one stays
    // queued rather than written immediately, then drop the peer.
    for i in 0..4u32 {
        endpoint_a
            .enqueue(test_frame(format!("msg-{i}").as_bytes()), poll_a.registry(), DequeuePosition::Back)
            .unwrap();
    }
    drop(b_sock);

    thread::sleep(Duration::from_millis(20));

    let unsent_before = endpoint_a.queued_frames();
    let unsent = endpoint_a.take_unsent();
    assert_eq!(unsent.len(), unsent_before);
}
