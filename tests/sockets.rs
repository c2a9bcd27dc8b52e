use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, UdpSocket},
    os::{fd::IntoRawFd, unix::net::UnixStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::unbounded;
use sockmux::{
    CallbackTypes, ManagerConfig, RunLoop, Socket, SocketError, SocketEvent, SocketFlags,
    SocketSignature,
};
use socket2::{Domain, SockAddr, Type};

const PATIENCE: Duration = Duration::from_secs(5);

fn loopback() -> SockAddr {
    SockAddr::from(SocketAddr::from(([127, 0, 0, 1], 0)))
}

fn deadline() -> Instant {
    Instant::now() + PATIENCE
}

#[test]
fn open_reuses_the_wrapper_for_a_handle() {
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.into_raw_fd();

    let first = Socket::open(fd, CallbackTypes::READ, |_, _| {}).unwrap();
    let second = Socket::open(fd, CallbackTypes::DATA, |_, _| {}).unwrap();
    assert_eq!(first, second);
    assert_eq!(second.callback_types(), CallbackTypes::READ);

    let replacement = Socket::open_unique(fd, CallbackTypes::DATA, |_, _| {}).unwrap();
    assert_ne!(first, replacement);
    assert!(!first.is_valid());
    assert_eq!(replacement.native(), Some(fd));
    assert_eq!(replacement.callback_types(), CallbackTypes::DATA);

    replacement.invalidate();
}

#[test]
fn configuring_a_running_manager_fails() {
    let (a, _b) = UnixStream::pair().unwrap();
    let socket = Socket::open(a.into_raw_fd(), CallbackTypes::READ, |_, _| {}).unwrap();
    assert!(matches!(
        sockmux::configure(ManagerConfig::default()),
        Err(SocketError::AlreadyStarted)
    ));
    socket.invalidate();
}

#[test]
fn stream_data_arrives_in_order_then_end_of_stream_invalidates() {
    let (a, mut b) = UnixStream::pair().unwrap();
    let (tx, rx) = unbounded();
    let socket = Socket::open(a.into_raw_fd(), CallbackTypes::DATA, move |_, event| {
        if let SocketEvent::Data { data, .. } = event {
            tx.send(data).unwrap();
        }
    })
    .unwrap();
    assert!(socket.is_connection_oriented());

    let run_loop = RunLoop::new();
    run_loop.add_socket(&socket).unwrap();

    let chunks: Vec<Vec<u8>> = (0..20).map(|i| format!("chunk-{i:02};").into_bytes()).collect();
    let expected = chunks.concat();
    let writer = thread::spawn(move || {
        for chunk in chunks {
            b.write_all(&chunk).unwrap();
            thread::sleep(Duration::from_millis(2));
        }
    });

    let mut received = Vec::new();
    let mut end_events = 0;
    let finished = run_loop.run_while(deadline(), || {
        for data in rx.try_iter() {
            if data.is_empty() {
                end_events += 1;
            } else {
                received.extend(data);
            }
        }
        end_events > 0
    });
    writer.join().unwrap();

    assert!(finished);
    assert_eq!(received, expected);
    assert_eq!(end_events, 1);
    assert!(!socket.is_valid());
    assert_eq!(socket.native(), None);
}

#[test]
fn full_read_buffer_is_delivered_in_one_event() {
    let (a, mut b) = UnixStream::pair().unwrap();
    let (tx, rx) = unbounded();
    let socket = Socket::open(a.into_raw_fd(), CallbackTypes::READ, move |socket, _| {
        let mut buf = [0; 64];
        if let Ok(n) = socket.read(&mut buf) {
            tx.send(buf[..n].to_vec()).unwrap();
        }
    })
    .unwrap();
    socket.set_read_buffer(Duration::from_secs(30), 8);

    let run_loop = RunLoop::new();
    run_loop.add_socket(&socket).unwrap();

    b.write_all(b"abcd").unwrap();
    thread::sleep(Duration::from_millis(20));
    b.write_all(b"efgh").unwrap();

    let mut events = Vec::new();
    assert!(run_loop.run_while(deadline(), || {
        events.extend(rx.try_iter());
        !events.is_empty()
    }));
    assert_eq!(events, vec![b"abcdefgh".to_vec()]);

    socket.invalidate();
}

#[test]
fn partial_read_buffer_waits_for_its_timeout() {
    let (a, mut b) = UnixStream::pair().unwrap();
    let (tx, rx) = unbounded();
    let socket = Socket::open(a.into_raw_fd(), CallbackTypes::READ, move |socket, _| {
        let mut buf = [0; 64];
        if let Ok(n) = socket.read(&mut buf) {
            tx.send((Instant::now(), buf[..n].to_vec())).unwrap();
        }
    })
    .unwrap();
    let timeout = Duration::from_millis(200);
    socket.set_read_buffer(timeout, 16);

    let run_loop = RunLoop::new();
    run_loop.add_socket(&socket).unwrap();

    let sent_at = Instant::now();
    b.write_all(b"abc").unwrap();

    let mut events = Vec::new();
    assert!(run_loop.run_while(deadline(), || {
        events.extend(rx.try_iter());
        !events.is_empty()
    }));
    let (at, data) = &events[0];
    assert_eq!(data, b"abc");
    assert!(*at >= sent_at + timeout);

    socket.invalidate();
}

#[test]
fn datagrams_round_trip() {
    let (tx, rx) = unbounded();
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None, CallbackTypes::DATA, move |_, event| {
        if let SocketEvent::Data { address, data } = event {
            tx.send((address, data)).unwrap();
        }
    })
    .unwrap();
    assert!(!socket.is_connection_oriented());
    socket.bind(&loopback()).unwrap();
    let address = socket.copy_address().and_then(|a| a.as_socket()).unwrap();

    let run_loop = RunLoop::new();
    run_loop.add_socket(&socket).unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(PATIENCE)).unwrap();
    peer.send_to(b"ping", address).unwrap();

    let mut received = Vec::new();
    assert!(run_loop.run_while(deadline(), || {
        received.extend(rx.try_iter());
        !received.is_empty()
    }));
    let (from, data) = received.remove(0);
    assert_eq!(data, b"ping");
    let from = from.unwrap();
    assert_eq!(from.as_socket(), Some(peer.local_addr().unwrap()));

    assert_eq!(socket.send(Some(&from), b"pong", PATIENCE).unwrap(), 4);
    let mut buf = [0; 16];
    let (n, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");

    // a datagram socket survives an empty datagram
    peer.send_to(b"", address).unwrap();
    let mut received = Vec::new();
    assert!(run_loop.run_while(deadline(), || {
        received.extend(rx.try_iter());
        !received.is_empty()
    }));
    assert!(received[0].1.is_empty());
    assert!(socket.is_valid());

    socket.invalidate();
}

#[test]
fn accepts_connections_and_streams_round_trip() {
    let (tx, rx) = unbounded();
    let signature = SocketSignature {
        domain: Domain::IPV4,
        ty: Type::STREAM,
        protocol: None,
        address: loopback(),
    };
    let listener = Socket::create_bound(&signature, CallbackTypes::ACCEPT, move |_, event| {
        if let SocketEvent::Accept { handle, .. } = event {
            tx.send(handle).unwrap();
        }
    })
    .unwrap();
    let address = listener.copy_address().and_then(|a| a.as_socket()).unwrap();

    let run_loop = RunLoop::new();
    run_loop.add_socket(&listener).unwrap();

    let mut client = TcpStream::connect(address).unwrap();
    client.set_read_timeout(Some(PATIENCE)).unwrap();

    let mut accepted = Vec::new();
    assert!(run_loop.run_while(deadline(), || {
        accepted.extend(rx.try_iter());
        !accepted.is_empty()
    }));
    let handle = accepted.remove(0);

    let server = Socket::open(handle.into_raw_fd(), CallbackTypes::READ, |_, _| {}).unwrap();
    assert_eq!(
        server.copy_peer_address().and_then(|a| a.as_socket()),
        Some(client.local_addr().unwrap())
    );
    assert_eq!(server.send(None, b"hello", PATIENCE).unwrap(), 5);
    let mut buf = [0; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    client.write_all(b"world").unwrap();
    let mut buf = [0; 5];
    let mut read = 0;
    while read < 5 {
        read += server.read(&mut buf[read..]).unwrap();
    }
    assert_eq!(&buf, b"world");

    server.invalidate();
    listener.invalidate();
}

fn tcp_socket() -> Socket {
    Socket::new(Domain::IPV4, Type::STREAM, None, CallbackTypes::READ, |_, _| {}).unwrap()
}

#[test]
fn timed_connect_reports_success_and_refusal() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = SockAddr::from(listener.local_addr().unwrap());

    let socket = tcp_socket();
    socket.connect(&address, Some(PATIENCE)).unwrap();
    assert!(listener.accept().is_ok());
    socket.invalidate();

    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        SockAddr::from(listener.local_addr().unwrap())
    };
    let socket = tcp_socket();
    let err = socket.connect(&closed, Some(PATIENCE)).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(nix::libc::ECONNREFUSED));
    socket.invalidate();
}

#[test]
fn background_connect_is_reported_through_the_callback() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = SockAddr::from(listener.local_addr().unwrap());

    let (tx, rx) = unbounded();
    let socket = Socket::new(
        Domain::IPV4,
        Type::STREAM,
        None,
        CallbackTypes::CONNECT | CallbackTypes::WRITE,
        move |_, event| {
            tx.send(event).unwrap();
        },
    )
    .unwrap();
    socket.connect(&address, None).unwrap();

    let run_loop = RunLoop::new();
    run_loop.add_socket(&socket).unwrap();

    let mut events = Vec::new();
    assert!(run_loop.run_while(deadline(), || {
        events.extend(rx.try_iter());
        !events.is_empty()
    }));
    assert!(matches!(events[0], SocketEvent::Connect { error: None }));
    // write is not auto re-enabled, so one event of each kind at most
    assert!(events.iter().skip(1).all(|e| e.kind() == CallbackTypes::WRITE));

    socket.invalidate();
}

#[test]
fn invalidate_is_idempotent_across_threads() {
    let (a, mut b) = UnixStream::pair().unwrap();
    let marker = Arc::new(());
    let held = marker.clone();
    let socket = Socket::open(a.into_raw_fd(), CallbackTypes::DATA, move |_, _| {
        let _ = &held;
    })
    .unwrap();
    let run_loop = RunLoop::new();
    run_loop.add_socket(&socket).unwrap();
    assert_eq!(Arc::strong_count(&marker), 2);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let socket = socket.clone();
            thread::spawn(move || socket.invalidate())
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    socket.invalidate();

    assert!(!socket.is_valid());
    // the callback is released exactly once and the handle is closed
    assert_eq!(Arc::strong_count(&marker), 1);
    let mut buf = [0; 1];
    b.set_read_timeout(Some(PATIENCE)).unwrap();
    assert_eq!(b.read(&mut buf).unwrap(), 0);

    assert!(matches!(socket.read(&mut buf), Err(SocketError::Invalid)));
    assert!(run_loop.add_socket(&socket).is_err());
}

#[test]
fn handle_survives_when_not_closing_on_invalidate() {
    let (a, mut b) = UnixStream::pair().unwrap();
    let fd = a.into_raw_fd();
    let socket = Socket::open(fd, CallbackTypes::READ, |_, _| {}).unwrap();
    assert!(socket.flags().contains(SocketFlags::CLOSE_ON_INVALIDATE));
    socket.set_flags(socket.flags() & !SocketFlags::CLOSE_ON_INVALIDATE);
    socket.invalidate();

    let a = Socket::open(fd, CallbackTypes::READ, |_, _| {}).unwrap();
    b.write_all(b"still open").unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(a.bytes_available().unwrap(), 10);
    a.invalidate();
}

#[test]
fn disabled_data_callbacks_stay_quiet_until_enabled() {
    let (a, mut b) = UnixStream::pair().unwrap();
    let (tx, rx) = unbounded();
    let socket = Socket::open(a.into_raw_fd(), CallbackTypes::DATA, move |_, event| {
        if let SocketEvent::Data { data, .. } = event {
            tx.send(data).unwrap();
        }
    })
    .unwrap();
    let run_loop = RunLoop::new();
    run_loop.add_socket(&socket).unwrap();
    socket.disable_callbacks(CallbackTypes::DATA);

    b.write_all(b"queued").unwrap();
    let quiet = !run_loop.run_while(Instant::now() + Duration::from_millis(200), || {
        !rx.is_empty()
    });
    assert!(quiet);

    socket.enable_callbacks(CallbackTypes::DATA);
    let mut received = Vec::new();
    assert!(run_loop.run_while(deadline(), || {
        received.extend(rx.try_iter().flatten());
        received.len() >= 6
    }));
    assert_eq!(received, b"queued");

    socket.invalidate();
}
