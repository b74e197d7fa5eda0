// Integration tests for `Session` against a scripted relay.
//
// `MockRelay` binds the relay's three sockets on 127.0.0.1 with OS-assigned
// ports. Each test connects a real `Session`, then plays the relay's side by
// hand: reading the frames the client writes, writing replies on the stream
// the client reads, and exchanging datagrams. This exercises the real worker
// threads, framing, scheduler and router end to end.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use poolnet_client::{ClientConfig, ClientError, ConnId, Message, PriorityChannel, Session};
use poolnet_protocol::{FrameDecoder, encode_frame, keys};

const WAIT: Duration = Duration::from_secs(5);

type Reply = Result<Option<Message>, ClientError>;

struct MockRelay {
    send_listener: TcpListener,
    read_listener: TcpListener,
    udp: UdpSocket,
}

impl MockRelay {
    fn bind() -> Self {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.set_read_timeout(Some(WAIT)).unwrap();
        Self {
            send_listener: TcpListener::bind("127.0.0.1:0").unwrap(),
            read_listener: TcpListener::bind("127.0.0.1:0").unwrap(),
            udp,
        }
    }

    fn ports(&self) -> (u16, u16, u16) {
        (
            self.send_listener.local_addr().unwrap().port(),
            self.read_listener.local_addr().unwrap().port(),
            self.udp.local_addr().unwrap().port(),
        )
    }

    /// Accept the client's two streams.
    fn accept(&self) -> RelayConn {
        let (outbound, _) = self.read_listener.accept().unwrap();
        let (inbound, _) = self.send_listener.accept().unwrap();
        inbound.set_read_timeout(Some(WAIT)).unwrap();
        RelayConn {
            inbound,
            outbound,
            udp: self.udp.try_clone().unwrap(),
            client_udp: None,
            decoder: FrameDecoder::new(),
            frames: VecDeque::new(),
        }
    }
}

/// The relay's view of one connected client.
struct RelayConn {
    /// Frames the client writes.
    inbound: TcpStream,
    /// Frames we write to the client.
    outbound: TcpStream,
    udp: UdpSocket,
    client_udp: Option<SocketAddr>,
    decoder: FrameDecoder,
    frames: VecDeque<Message>,
}

impl RelayConn {
    fn send(&mut self, msg: &Message) {
        let bytes = encode_frame(msg).unwrap().to_bytes();
        self.outbound.write_all(&bytes).unwrap();
        self.outbound.flush().unwrap();
    }

    /// Next frame the client wrote.
    fn recv(&mut self) -> Message {
        let mut buf = [0u8; 4096];
        while self.frames.is_empty() {
            let n = self.inbound.read(&mut buf).expect("client frame");
            assert!(n > 0, "client closed its send stream");
            self.frames.extend(self.decoder.push(&buf[..n]));
        }
        self.frames.pop_front().unwrap()
    }

    /// Next datagram from the client matching `wanted`, remembering where it
    /// came from.
    fn recv_datagram(&mut self, wanted: impl Fn(&Message) -> bool) -> Message {
        let mut buf = [0u8; 65_536];
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            let (n, from) = self.udp.recv_from(&mut buf).expect("client datagram");
            self.client_udp = Some(from);
            let msg = Message::from_json_slice(&buf[..n]).unwrap();
            if wanted(&msg) {
                return msg;
            }
        }
        panic!("no matching datagram");
    }

    fn send_datagram(&self, msg: &Message) {
        let to = self.client_udp.expect("client datagram address");
        self.udp.send_to(&msg.to_json_bytes().unwrap(), to).unwrap();
    }
}

fn test_config() -> ClientConfig {
    ClientConfig {
        ping_interval_ms: 60_000,
        liveness_timeout_enabled: false,
        poll_interval_ms: 20,
        shutdown_join_timeout_ms: 1_000,
        ..ClientConfig::default()
    }
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Connect a session and complete the handshake with connection ID 42.
fn connected(config: ClientConfig) -> (MockRelay, RelayConn, Session) {
    let relay = MockRelay::bind();
    let (send_port, read_port, udp_port) = relay.ports();
    let session = Session::new(config);
    session.init();

    let (tx, rx) = mpsc::channel();
    session.connect("127.0.0.1", send_port, read_port, udp_port, move |result| {
        let _ = tx.send(result);
    });
    let mut conn = relay.accept();
    assert!(session.is_connected());

    conn.send(&Message::new().with(keys::CONNECT, true).with(keys::CONN_ID, 42));
    let reply: Reply = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(reply.unwrap().unwrap().conn_id(), Some(ConnId(42)));

    let registration = Message::conn_registration(ConnId(42));
    assert_eq!(conn.recv(), registration);
    assert_eq!(conn.recv_datagram(|m| !m.contains_key(keys::PING)), registration);
    (relay, conn, session)
}

fn reply_channel() -> (impl FnOnce(Reply) + Send + 'static, mpsc::Receiver<Reply>) {
    let (tx, rx) = mpsc::channel();
    (
        move |result: Reply| {
            let _ = tx.send(result);
        },
        rx,
    )
}

#[test]
fn handshake_assigns_conn_id_and_registers_both_channels() {
    let (_relay, _conn, session) = connected(test_config());
    assert_eq!(session.conn_id(), ConnId(42));
    assert!(session.is_connected());
    assert!(session.is_started());
}

#[test]
fn add_to_pool_round_trip() {
    let (_relay, mut conn, session) = connected(test_config());
    let (cb, rx) = reply_channel();

    session.add_to_pool("lobby7", "lobby", cb);
    let request = conn.recv();
    assert_eq!(request.text(keys::ADD_POOL).as_deref(), Some("lobby7"));
    assert_eq!(request.text(keys::POOL_TYPE).as_deref(), Some("lobby"));

    conn.send(&Message::new().with(keys::ADD_POOL, "lobby7"));
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    assert!(session.all_pools().contains(&"lobby7".to_string()));
    assert_eq!(session.main_pool(), "");
}

#[test]
fn move_to_pool_then_guards() {
    let (_relay, mut conn, session) = connected(test_config());

    let (cb, rx) = reply_channel();
    session.move_to_pool("match-1", "match", cb);
    let request = conn.recv();
    assert_eq!(request.text(keys::CHANGE_POOL).as_deref(), Some("match-1"));
    assert_eq!(request.text(keys::FROM_POOL).as_deref(), Some(""));
    conn.send(&Message::new().with(keys::CHANGE_POOL, "match-1"));
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    assert_eq!(session.main_pool(), "match-1");

    // Already there: completes at once, sends nothing.
    let (cb, rx) = reply_channel();
    session.move_to_pool("match-1", "match", cb);
    assert!(matches!(rx.try_recv(), Ok(Ok(None))));

    // The main pool can only be left by moving.
    let (cb, rx) = reply_channel();
    session.leave_pool("match-1", "match", cb);
    assert!(matches!(rx.try_recv(), Ok(Err(ClientError::LeaveMainPool(_)))));

    // Next frame on the wire is this marker, proving nothing was sent above.
    session.send_reliable(Message::new().with("marker", 1), PriorityChannel::AllCost, None);
    assert_eq!(conn.recv(), Message::new().with("marker", 1));
}

#[test]
fn leave_additional_pool() {
    let (_relay, mut conn, session) = connected(test_config());
    let (cb, rx) = reply_channel();
    session.add_to_pool("side", "chat", cb);
    conn.recv();
    conn.send(&Message::new().with(keys::ADD_POOL, "side"));
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());

    let (cb, rx) = reply_channel();
    session.leave_pool("side", "chat", cb);
    assert_eq!(conn.recv().text(keys::LEAVE_POOL).as_deref(), Some("side"));
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Ok(None)));
    assert!(!session.all_pools().contains(&"side".to_string()));
}

#[test]
fn pool_master_promotion() {
    let (_relay, mut conn, session) = connected(test_config());
    let (cb, rx) = reply_channel();
    session.set_connection_as_pool_master("lobby7", cb);
    assert_eq!(conn.recv(), Message::pool_master("lobby7"));

    conn.send(&Message::pool_master("lobby7"));
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    assert!(session.is_pool_master());
    assert_eq!(session.pool_master_of().as_deref(), Some("lobby7"));
}

#[test]
fn inbound_messages_land_in_their_mailboxes() {
    let (_relay, mut conn, session) = connected(test_config());

    conn.send(
        &Message::new()
            .with(keys::SEND_TO_CONN_ID, true)
            .with(keys::CONN_ID, 42)
            .with("pool", "lobby7")
            .with("text", "direct"),
    );
    conn.send(&Message::new().with(keys::SEND_TO_POOL, "lobby7").with("text", "pool"));
    conn.send(&Message::new().with(keys::SEND_TO_POOL_MASTER, "lobby7").with("text", "master"));
    conn.send_datagram(&Message::new().with(keys::SEND_TO_OTHERS, "lobby7").with("text", "udp"));

    wait_until("server mailbox", || session.has_server_messages());
    wait_until("conn mailbox", || session.has_conn_messages());

    let direct = session.check_for_conn_messages().unwrap();
    assert_eq!(direct.text("text").as_deref(), Some("direct"));
    assert!(session.check_for_conn_messages().is_none());

    let master = session.check_for_server_messages().unwrap();
    assert_eq!(master.text("text").as_deref(), Some("master"));

    let mut client = Vec::new();
    wait_until("pool mailbox", || {
        while let Some(msg) = session.check_for_client_messages() {
            client.push(msg.text("text").unwrap_or_default());
        }
        client.len() == 2
    });
    client.sort();
    assert_eq!(client, vec!["pool".to_string(), "udp".to_string()]);
}

#[test]
fn directed_sends_stamp_routing_keys() {
    let (_relay, mut conn, session) = connected(test_config());

    session.send_reliable_to_others(
        Message::new().with("text", "hi all"),
        "lobby7",
        PriorityChannel::Reliable,
        None,
    );
    let sent = conn.recv();
    assert_eq!(sent.text(keys::SEND_TO_OTHERS).as_deref(), Some("lobby7"));
    assert_eq!(sent.conn_id(), Some(ConnId(42)));

    session.send_reliable_to_conn(
        Message::new().with("text", "psst"),
        ConnId(7),
        PriorityChannel::Reliable,
        None,
    );
    let sent = conn.recv();
    assert_eq!(sent.get(keys::SEND_TO_CONN_ID), Some(&serde_json::Value::Bool(true)));
    assert_eq!(sent.conn_id(), Some(ConnId(7)));

    let (tx, rx) = mpsc::channel();
    session.send_unreliable_to_pool(
        Message::new().with("text", "fast"),
        "lobby7",
        Some(Box::new(move |result| {
            let _ = tx.send(result.is_ok());
        })),
    );
    assert!(rx.recv_timeout(WAIT).unwrap());
    let datagram = conn.recv_datagram(|m| m.contains_key(keys::SEND_TO_POOL));
    assert_eq!(datagram.text("text").as_deref(), Some("fast"));
}

#[test]
fn reliable_send_callback_fires_after_write() {
    let (_relay, mut conn, session) = connected(test_config());
    let (tx, rx) = mpsc::channel();

    session.send_reliable(
        Message::new().with("state", 1),
        PriorityChannel::StateUpdate,
        Some(Box::new(move |result| {
            let _ = tx.send(result.is_ok());
        })),
    );

    assert!(rx.recv_timeout(WAIT).unwrap());
    assert_eq!(conn.recv(), Message::new().with("state", 1));
}

#[test]
fn heartbeat_echo_updates_rtt() {
    let config = ClientConfig {
        ping_interval_ms: 20,
        ..test_config()
    };
    let (_relay, mut conn, session) = connected(config);

    let ping = conn.recv_datagram(|m| m.contains_key(keys::PING));
    assert_eq!(ping.conn_id(), Some(ConnId(42)));
    let sent = ping.echoed_time_ms().unwrap();

    // Echo with the timestamp pushed back so the measured RTT is non-zero.
    let mut echo = ping.clone();
    echo.insert(keys::TIME, sent - 30);
    conn.send_datagram(&echo);

    wait_until("rtt sample", || session.rtt_ms() >= 30);
    assert!(session.is_connected());
}

#[test]
fn silent_relay_trips_liveness_timeout() {
    let config = ClientConfig {
        liveness_timeout_enabled: true,
        liveness_check_interval_ms: 20,
        liveness_grace_ms: 100,
        ..test_config()
    };
    let (_relay, _conn, session) = connected(config);

    wait_until("liveness timeout", || !session.is_connected());
}

#[test]
fn relay_closing_stream_marks_disconnected() {
    let (relay, conn, session) = connected(test_config());
    drop(conn);
    wait_until("stream loss", || !session.is_connected());

    let (send_port, read_port, udp_port) = relay.ports();
    let (cb, rx) = reply_channel();
    session.connect("127.0.0.1", send_port, read_port, udp_port, cb);
    assert!(matches!(rx.try_recv(), Ok(Err(ClientError::ConnectionLost))));
}

/// Start a connect and answer it with `reply` instead of a valid handshake.
fn connect_with_reply(reply: &Message) -> (MockRelay, RelayConn, Session, Reply) {
    let relay = MockRelay::bind();
    let (send_port, read_port, udp_port) = relay.ports();
    let session = Session::new(test_config());
    session.init();

    let (cb, rx) = reply_channel();
    session.connect("127.0.0.1", send_port, read_port, udp_port, cb);
    let mut conn = relay.accept();
    conn.send(reply);
    let result = rx.recv_timeout(WAIT).unwrap();
    (relay, conn, session, result)
}

#[test]
fn whole_float_conn_id_completes_handshake() {
    let reply = Message::new().with(keys::CONNECT, true).with(keys::CONN_ID, 42.0);
    let (_relay, mut conn, session, result) = connect_with_reply(&reply);

    assert!(result.is_ok());
    assert_eq!(session.conn_id(), ConnId(42));
    assert_eq!(conn.recv(), Message::conn_registration(ConnId(42)));

    session.send_reliable(Message::new().with("go", 1), PriorityChannel::AllCost, None);
    assert_eq!(conn.recv(), Message::new().with("go", 1));
}

#[test]
fn connect_reply_without_conn_id_fails_connect() {
    let reply = Message::new().with(keys::CONNECT, true);
    let (_relay, _conn, session, result) = connect_with_reply(&reply);

    assert!(matches!(result, Err(ClientError::Protocol(_))));
    assert!(!session.is_connected());
}

#[test]
fn datagram_send_error_forces_disconnect() {
    let (_relay, _conn, session) = connected(test_config());
    let (tx, rx) = mpsc::channel();

    // Larger than any UDP payload, so the send itself fails.
    let oversized = Message::new().with("blob", "x".repeat(70_000));
    session.send_unreliable(
        oversized,
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    );

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(ClientError::Io(_))));
    assert!(!session.is_started());
    assert!(!session.is_connected());
}

#[test]
fn unreachable_relay_datagram_port_forces_disconnect() {
    let (relay, mut conn, session) = connected(test_config());
    // Close every handle on the relay's datagram port.
    drop(relay);
    conn.udp = UdpSocket::bind("127.0.0.1:0").unwrap();

    // The port-unreachable error surfaces on whichever of the send or
    // receive paths touches the socket next; both tear the session down.
    let deadline = Instant::now() + WAIT;
    while session.is_started() {
        assert!(Instant::now() < deadline, "session never disconnected");
        let (tx, rx) = mpsc::channel();
        session.send_unreliable(
            Message::new().with("n", 1),
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        match rx.recv_timeout(WAIT).unwrap() {
            Ok(()) | Err(ClientError::Io(_)) | Err(ClientError::NotStarted) => {}
            Err(other) => panic!("unexpected send error: {other}"),
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!session.is_connected());
}

#[test]
fn disconnect_keeps_stream_sockets_until_shutdown() {
    let (_relay, _conn, session) = connected(test_config());
    assert!(session.has_stream_clients());

    session.disconnect();
    assert!(session.has_stream_clients());

    session.shutdown_stream_clients();
    assert!(!session.has_stream_clients());
}

#[test]
fn disconnect_fails_pending_and_stops_workers() {
    let (_relay, mut conn, session) = connected(test_config());
    let (cb, rx) = reply_channel();
    session.add_to_pool("never-answered", "lobby", cb);
    conn.recv();

    let started = Instant::now();
    session.disconnect();
    assert!(started.elapsed() < WAIT);

    assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Disconnected))));
    assert!(!session.is_connected());
    assert!(!session.is_started());

    let (tx, rx) = mpsc::channel();
    session.send_reliable(
        Message::new().with("late", true),
        PriorityChannel::Reliable,
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    );
    assert!(matches!(rx.try_recv(), Ok(Err(ClientError::NotStarted))));
}

#[test]
fn reconnect_after_init() {
    let (_relay, _conn, session) = connected(test_config());
    session.disconnect();
    session.init();

    let relay = MockRelay::bind();
    let (send_port, read_port, udp_port) = relay.ports();
    let (cb, rx) = reply_channel();
    session.connect("127.0.0.1", send_port, read_port, udp_port, cb);
    let mut conn = relay.accept();
    conn.send(&Message::new().with(keys::CONNECT, true).with(keys::CONN_ID, 43));

    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    assert_eq!(conn.recv(), Message::conn_registration(ConnId(43)));
    assert_eq!(session.conn_id(), ConnId(43));
}
