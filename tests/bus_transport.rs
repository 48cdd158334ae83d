//! Integration tests for the bus transport: echo round trips, delivery
//! tracking, ack discipline, admission limits, and server lifecycle.
//!
//! Tests that need a misbehaving peer speak the wire protocol directly over
//! a std TcpStream using the public codec types.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use uuid::Uuid;

use millrace::bus::{
    BusAddr, BusConnection, BusError, BusServer, BusServerConfig, CodecLimits, DeliveryTracking,
    Message, MessageHandler, Packet, PacketDecoder, PacketEncoder, PacketType, SendOptions, dial,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ===== Fixtures =====

fn server_config() -> BusServerConfig {
    BusServerConfig {
        listen: BusAddr::tcp("127.0.0.1:0"),
        ..BusServerConfig::default()
    }
}

fn connect_addr(handle: &millrace::bus::BusServerHandle) -> BusAddr {
    BusAddr::tcp(handle.local_addr().expect("tcp listen addr").to_string())
}

/// Replies to every inbound message with the same parts.
struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn handle_message(&self, message: Message, connection: &BusConnection) {
        connection.send(message);
    }
}

/// Forwards every inbound message to a channel.
struct CaptureHandler {
    tx: Sender<Message>,
}

impl MessageHandler for CaptureHandler {
    fn handle_message(&self, message: Message, _connection: &BusConnection) {
        let _ = self.tx.send(message);
    }
}

/// Ignores all inbound messages.
struct NullHandler;

impl MessageHandler for NullHandler {
    fn handle_message(&self, _message: Message, _connection: &BusConnection) {}
}

/// Remembers the server-side connection of the last handled message.
struct RememberHandler {
    seen: Mutex<Option<BusConnection>>,
}

impl MessageHandler for RememberHandler {
    fn handle_message(&self, message: Message, connection: &BusConnection) {
        *self.seen.lock().unwrap() = Some(connection.clone());
        connection.send(message);
    }
}

// ===== Raw peer plumbing =====

fn read_raw_packet(stream: &mut TcpStream, decoder: &mut PacketDecoder) -> Packet {
    loop {
        if decoder.is_finished() {
            return decoder.take_packet().expect("completed packet");
        }
        let span = decoder.chunk();
        let n = stream.read(span).expect("raw peer read");
        assert!(n > 0, "peer closed mid-packet");
        assert!(decoder.advance(n), "raw peer saw a framing violation");
    }
}

fn write_raw_packet(
    stream: &mut TcpStream,
    packet_type: PacketType,
    flags: u8,
    packet_id: Uuid,
    message: &Message,
) {
    let mut encoder = PacketEncoder::new(CodecLimits::default());
    assert!(encoder.start(packet_type, flags, packet_id, message));
    while let Some(fragment) = encoder.chunk().cloned() {
        stream.write_all(&fragment).expect("raw peer write");
        encoder.next_chunk();
    }
    stream.flush().expect("raw peer flush");
}

/// Drains the socket until the peer hangs up.
fn drain_until_eof(stream: &mut TcpStream) {
    let mut sink = [0u8; 4096];
    loop {
        match stream.read(&mut sink) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

// ===== Round trips =====

#[test]
fn echo_round_trip() {
    let handle = BusServer::new(server_config())
        .start(Arc::new(EchoHandler))
        .expect("server start");
    let (tx, rx) = channel::unbounded();
    let conn = dial(
        &connect_addr(&handle),
        Default::default(),
        Arc::new(CaptureHandler { tx }),
    );

    let send = conn.send(Message::single("hello"));
    assert!(matches!(send.wait_timeout(TEST_TIMEOUT), Some(Ok(()))));

    let echoed = rx.recv_timeout(TEST_TIMEOUT).expect("echo reply");
    assert_eq!(echoed.part_count(), 1);
    assert_eq!(echoed.parts()[0].as_ref(), b"hello");

    let stats = conn.stats();
    assert!(stats.packets_sent >= 1);
    assert!(stats.packets_received >= 1);
    assert!(stats.bytes_sent > 0);
    assert_eq!(stats.unacked, 0);

    handle.stop();
}

#[test]
fn multipart_message_survives_the_trip() {
    let handle = BusServer::new(server_config())
        .start(Arc::new(EchoHandler))
        .expect("server start");
    let (tx, rx) = channel::unbounded();
    let conn = dial(
        &connect_addr(&handle),
        Default::default(),
        Arc::new(CaptureHandler { tx }),
    );

    let big = vec![0xa5u8; 100 * 1024];
    let message = Message::from_parts(vec![
        bytes::Bytes::new(),
        bytes::Bytes::from_static(b"alpha"),
        bytes::Bytes::from(big.clone()),
    ]);
    assert!(matches!(
        conn.send(message).wait_timeout(TEST_TIMEOUT),
        Some(Ok(()))
    ));

    let echoed = rx.recv_timeout(TEST_TIMEOUT).expect("echo reply");
    assert_eq!(echoed.part_count(), 3);
    assert!(echoed.parts()[0].is_empty());
    assert_eq!(echoed.parts()[1].as_ref(), b"alpha");
    assert_eq!(echoed.parts()[2].as_ref(), big.as_slice());

    handle.stop();
}

#[cfg(unix)]
#[test]
fn unix_socket_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let addr = BusAddr::unix(dir.path().join("bus.sock"));
    let config = BusServerConfig {
        listen: addr.clone(),
        ..BusServerConfig::default()
    };
    let handle = BusServer::new(config)
        .start(Arc::new(EchoHandler))
        .expect("server start");
    assert!(handle.local_addr().is_none());

    let (tx, rx) = channel::unbounded();
    let conn = dial(&addr, Default::default(), Arc::new(CaptureHandler { tx }));
    assert!(matches!(
        conn.send(Message::single("over unix")).wait_timeout(TEST_TIMEOUT),
        Some(Ok(()))
    ));
    let echoed = rx.recv_timeout(TEST_TIMEOUT).expect("echo reply");
    assert_eq!(echoed.parts()[0].as_ref(), b"over unix");

    handle.stop();
}

// ===== Delivery tracking =====

#[test]
fn untracked_sends_resolve_at_enqueue() {
    let handle = BusServer::new(server_config())
        .start(Arc::new(NullHandler))
        .expect("server start");
    let conn = dial(&connect_addr(&handle), Default::default(), Arc::new(NullHandler));

    // Prove the connection is open with one tracked send first; the
    // transport acks it even though the handler never replies.
    assert!(matches!(
        conn.send(Message::single("warmup")).wait_timeout(TEST_TIMEOUT),
        Some(Ok(()))
    ));

    let send = conn.send_with(
        Message::single("fire and forget"),
        SendOptions {
            tracking: DeliveryTracking::None,
        },
    );
    // No ack was requested, so an immediate resolution can only come from
    // enqueue-time tracking.
    assert!(matches!(send.try_wait(), Some(Ok(()))));

    handle.stop();
}

#[test]
fn sends_after_termination_fail_with_the_first_error() {
    let handle = BusServer::new(server_config())
        .start(Arc::new(EchoHandler))
        .expect("server start");
    let conn = dial(&connect_addr(&handle), Default::default(), Arc::new(NullHandler));
    assert!(matches!(
        conn.send(Message::single("warmup")).wait_timeout(TEST_TIMEOUT),
        Some(Ok(()))
    ));

    conn.terminate(BusError::terminated("giving up"));
    assert!(conn.wait_closed_timeout(TEST_TIMEOUT));

    // Later failures do not displace the first error; even untracked sends
    // report it.
    for _ in 0..2 {
        let result = conn
            .send_with(
                Message::single("too late"),
                SendOptions {
                    tracking: DeliveryTracking::None,
                },
            )
            .wait();
        match result {
            Err(BusError::Terminated { reason }) => assert_eq!(reason, "giving up"),
            other => panic!("expected the first terminal error, got {other:?}"),
        }
    }
    match conn.terminal_error() {
        Some(BusError::Terminated { reason }) => assert_eq!(reason, "giving up"),
        other => panic!("expected the first terminal error, got {other:?}"),
    }

    handle.stop();
}

// ===== Ack discipline =====

#[test]
fn ack_with_wrong_id_is_a_protocol_violation() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind raw peer");
    let addr = listener.local_addr().expect("raw peer addr");
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("raw accept");
        let mut decoder = PacketDecoder::new(CodecLimits::default());
        let inbound = read_raw_packet(&mut stream, &mut decoder);
        assert_eq!(inbound.packet_type, PacketType::Message);
        write_raw_packet(
            &mut stream,
            PacketType::Ack,
            0,
            Uuid::new_v4(),
            &Message::new(),
        );
        drain_until_eof(&mut stream);
    });

    let conn = dial(
        &BusAddr::tcp(addr.to_string()),
        Default::default(),
        Arc::new(NullHandler),
    );
    let result = conn
        .send(Message::single("tracked"))
        .wait_timeout(TEST_TIMEOUT)
        .expect("send resolves");
    match result {
        Err(BusError::Protocol { reason }) => {
            assert!(
                reason.starts_with("ack for invalid packet id"),
                "unexpected reason: {reason}"
            );
        }
        other => panic!("expected a protocol violation, got {other:?}"),
    }
    assert!(conn.wait_closed_timeout(TEST_TIMEOUT));
    peer.join().expect("raw peer thread");
}

#[test]
fn unsolicited_ack_is_a_protocol_violation() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind raw peer");
    let addr = listener.local_addr().expect("raw peer addr");
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("raw accept");
        write_raw_packet(
            &mut stream,
            PacketType::Ack,
            0,
            Uuid::new_v4(),
            &Message::new(),
        );
        drain_until_eof(&mut stream);
    });

    let conn = dial(
        &BusAddr::tcp(addr.to_string()),
        Default::default(),
        Arc::new(NullHandler),
    );
    assert!(conn.wait_closed_timeout(TEST_TIMEOUT));
    match conn.terminal_error() {
        Some(BusError::Protocol { reason }) => {
            assert_eq!(reason, "unexpected ack received");
        }
        other => panic!("expected a protocol violation, got {other:?}"),
    }
    peer.join().expect("raw peer thread");
}

// ===== Admission and lifecycle =====

#[test]
fn admission_limit_rejects_extra_connections() {
    let config = BusServerConfig {
        max_connections: Some(2),
        ..server_config()
    };
    let handle = BusServer::new(config)
        .start(Arc::new(EchoHandler))
        .expect("server start");
    let addr = connect_addr(&handle);

    let (tx, rx) = channel::unbounded();
    let first = dial(&addr, Default::default(), Arc::new(CaptureHandler { tx: tx.clone() }));
    let second = dial(&addr, Default::default(), Arc::new(CaptureHandler { tx }));
    for conn in [&first, &second] {
        assert!(matches!(
            conn.send(Message::single("admitted")).wait_timeout(TEST_TIMEOUT),
            Some(Ok(()))
        ));
        rx.recv_timeout(TEST_TIMEOUT).expect("echo reply");
    }

    // The third connection is dropped at accept; its tracked send can only
    // fail.
    let third = dial(&addr, Default::default(), Arc::new(NullHandler));
    let result = third
        .send(Message::single("rejected"))
        .wait_timeout(TEST_TIMEOUT)
        .expect("send resolves");
    assert!(result.is_err(), "rejected connection acked a send");
    assert!(third.wait_closed_timeout(TEST_TIMEOUT));

    let stats = handle.stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.live, 2);

    handle.stop();
}

#[test]
fn server_stop_terminates_live_connections() {
    let handler = Arc::new(RememberHandler {
        seen: Mutex::new(None),
    });
    let handle = BusServer::new(server_config())
        .start(handler.clone())
        .expect("server start");
    let (tx, rx) = channel::unbounded();
    let conn = dial(
        &connect_addr(&handle),
        Default::default(),
        Arc::new(CaptureHandler { tx }),
    );
    assert!(matches!(
        conn.send(Message::single("ping")).wait_timeout(TEST_TIMEOUT),
        Some(Ok(()))
    ));
    rx.recv_timeout(TEST_TIMEOUT).expect("echo reply");

    handle.stop();

    let server_side = handler.seen.lock().unwrap().clone().expect("server side connection");
    assert!(matches!(
        server_side.terminal_error(),
        Some(BusError::ServerStopped)
    ));
    assert!(conn.wait_closed_timeout(TEST_TIMEOUT));
    assert!(conn.terminal_error().is_some());
}

#[test]
fn bind_conflict_reports_every_attempt() {
    let occupied = TcpListener::bind("127.0.0.1:0").expect("occupy a port");
    let addr = occupied.local_addr().expect("occupied addr");
    let config = BusServerConfig {
        listen: BusAddr::tcp(addr.to_string()),
        bind_retry_count: 2,
        bind_retry_backoff_ms: 1,
        ..BusServerConfig::default()
    };
    match BusServer::new(config).start(Arc::new(NullHandler)) {
        Err(BusError::BindFailed { attempts, addr, .. }) => {
            assert_eq!(attempts, 2);
            assert!(addr.contains("tcp://"));
        }
        other => panic!("expected a bind failure, got {other:?}"),
    }
}
