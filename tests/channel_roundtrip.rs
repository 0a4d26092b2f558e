//! Worker and broker talking over loopback TCP, plain and TLS.
//!
//! Usage:
//!   cargo test --test channel_roundtrip

use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use cachewire::{
    Acceptor, AcceptorConfig, Channel, ChannelError, ChannelEventListener, Connector,
    ConnectorConfig, Message, MessageType,
    protocol::{ServerIdentity, TrustPolicy},
};

const CA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/ca.pem");
const CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/localhost.pem");
const KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/localhost.key");

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Event {
    Received(Message),
    Closed,
    Failed,
}

/// Forwards everything a channel reports to a test-side receiver.
struct Recorder(mpsc::Sender<Event>);

impl Recorder {
    fn new() -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self(tx)), rx)
    }
}

impl ChannelEventListener for Recorder {
    fn message_received(&self, _channel: &Channel, message: Message) {
        let _ = self.0.send(Event::Received(message));
    }

    fn channel_closed(&self, _channel: &Channel) {
        let _ = self.0.send(Event::Closed);
    }

    fn exception_caught(&self, _channel: &Channel, _error: &ChannelError) {
        let _ = self.0.send(Event::Failed);
    }
}

/// Answers FETCH_ENTRY with a PUT_ENTRY for the same key, everything else with ACK.
fn answering_broker(channel: &Channel, message: Message) {
    let reply = match message.kind() {
        MessageType::FetchEntry => {
            let key = message.key().unwrap_or_default();
            Message::put_entry("broker", key, key.as_bytes().to_vec(), 1234)
        }
        _ => Message::ack("broker"),
    };
    channel.send_reply_message(&message, reply).unwrap();
}

/// Never answers.
fn silent_broker(_channel: &Channel, _message: Message) {}

fn start_broker(
    listener: Arc<dyn ChannelEventListener>,
    identity: Option<ServerIdentity>,
) -> Acceptor {
    let mut config = AcceptorConfig::new("127.0.0.1:0".parse().unwrap());
    if let Some(identity) = identity {
        config = config.with_identity(identity);
    }
    start_broker_with(config, listener)
}

fn start_broker_with(config: AcceptorConfig, listener: Arc<dyn ChannelEventListener>) -> Acceptor {
    let mut acceptor = Acceptor::bind(config, listener).unwrap();
    acceptor.start().unwrap();
    acceptor
}

fn worker_config(acceptor: &Acceptor) -> ConnectorConfig {
    ConnectorConfig::new("127.0.0.1", acceptor.local_addr().port())
        .with_connect_timeout_millis(5_000)
        .with_socket_timeout_millis(30_000)
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn fetch_entry_answered_with_put_entry() {
    let acceptor = start_broker(Arc::new(answering_broker), None);
    let (worker, _events) = Recorder::new();
    let mut connector = Connector::new(worker_config(&acceptor), worker);
    let channel = connector.connect().unwrap();

    let (tx, rx) = mpsc::channel();
    channel.send_message_with_async_reply(Message::fetch_entry("clientA", "k1"), move |o, r| {
        tx.send((o, r)).unwrap()
    });

    let (original, reply) = rx.recv_timeout(WAIT).unwrap();
    let reply = reply.unwrap();
    assert_eq!(reply.kind(), MessageType::PutEntry);
    assert_eq!(reply.key(), Some("k1"));
    assert_eq!(reply.data(), Some(&b"k1"[..]));
    assert_eq!(reply.expire_time(), Some(1234));
    assert_eq!(reply.reply_message_id(), original.message_id());
    assert_eq!(original.client_id(), "clientA");

    connector.close().unwrap();
}

#[test]
fn unsolicited_invalidate_reaches_worker_listener() {
    let acceptor = start_broker(Arc::new(answering_broker), None);
    let (worker, events) = Recorder::new();
    let mut connector = Connector::new(worker_config(&acceptor), worker);
    let channel = connector.connect().unwrap();

    let ack = channel
        .send_message_with_reply(Message::client_connection_request("clientA", "s3cret"), WAIT)
        .unwrap();
    assert_eq!(ack.kind(), MessageType::Ack);

    let brokers = acceptor.channels();
    assert_eq!(brokers.len(), 1);
    let (tx, rx) = mpsc::channel();
    brokers[0].send_one_way_message(Message::invalidate("broker", "k1"), move |res| {
        tx.send(res).unwrap()
    });
    rx.recv_timeout(WAIT).unwrap().unwrap();

    match events.recv_timeout(WAIT).unwrap() {
        Event::Received(message) => {
            assert_eq!(message.kind(), MessageType::Invalidate);
            assert_eq!(message.key(), Some("k1"));
            assert!(message.reply_message_id().is_none());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(channel.pending_replies(), 0);
}

#[test]
fn concurrent_blocking_requests_get_their_own_reply() {
    let acceptor = start_broker(Arc::new(answering_broker), None);
    let (worker, events) = Recorder::new();
    let mut connector = Connector::new(worker_config(&acceptor), worker);
    let channel = connector.connect().unwrap();

    thread::scope(|s| {
        for i in 0..32 {
            let channel = channel.clone();
            s.spawn(move || {
                let key = format!("key-{i}");
                let reply = channel
                    .send_message_with_reply(Message::fetch_entry("clientA", &key), WAIT)
                    .unwrap();
                assert_eq!(reply.key(), Some(key.as_str()));
            });
        }
    });

    assert_eq!(channel.pending_replies(), 0);
    assert!(events.try_recv().is_err());
}

#[test]
fn timed_out_request_leaves_channel_usable() {
    let delayed = |channel: &Channel, message: Message| {
        let channel = channel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let _ = channel.send_reply_message(&message, Message::ack("broker"));
        });
    };
    let acceptor = start_broker(Arc::new(delayed), None);
    let (worker, events) = Recorder::new();
    let mut connector = Connector::new(worker_config(&acceptor), worker);
    let channel = connector.connect().unwrap();

    let started = Instant::now();
    let res = channel.send_message_with_reply(
        Message::fetch_entry("clientA", "k1"),
        Duration::from_millis(50),
    );
    assert!(matches!(res, Err(ChannelError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_millis(200));

    // the late reply is dropped, not surfaced to the listener
    thread::sleep(Duration::from_millis(300));
    assert!(channel.is_valid());
    assert!(events.try_recv().is_err());

    let reply = channel
        .send_message_with_reply(Message::fetch_entry("clientA", "k2"), WAIT)
        .unwrap();
    assert_eq!(reply.kind(), MessageType::Ack);
}

#[test]
fn closing_connector_fails_pending_requests() {
    let acceptor = start_broker(Arc::new(silent_broker), None);
    let (worker, events) = Recorder::new();
    let mut connector = Connector::new(worker_config(&acceptor), worker);
    let channel = connector.connect().unwrap();

    let (tx, rx) = mpsc::channel();
    for i in 0..8 {
        let tx = tx.clone();
        channel.send_message_with_async_reply(
            Message::fetch_entry("clientA", format!("k{i}")),
            move |_, res| tx.send(res).unwrap(),
        );
    }

    connector.close().unwrap();
    connector.close().unwrap();

    for _ in 0..8 {
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(ChannelError::Closed)));
    }
    assert!(!channel.is_valid());
    assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Closed));
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

    let res = channel.send_message_with_reply(Message::ack("clientA"), WAIT);
    assert!(matches!(res, Err(ChannelError::Closed)));
}

#[test]
fn broker_shutdown_notifies_worker_once() {
    let mut acceptor = start_broker(Arc::new(silent_broker), None);
    let (worker, events) = Recorder::new();
    let mut connector = Connector::new(worker_config(&acceptor), worker);
    let channel = connector.connect().unwrap();

    let (tx, rx) = mpsc::channel();
    channel.send_message_with_async_reply(Message::fetch_entry("clientA", "k1"), move |_, res| {
        tx.send(res).unwrap()
    });
    wait_until(|| acceptor.channels().len() == 1);

    acceptor.close();

    assert!(rx.recv_timeout(WAIT).unwrap().is_err());
    wait_until(|| !channel.is_valid());
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        Event::Closed | Event::Failed
    ));
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn tls_with_pinned_ca() {
    let identity = ServerIdentity::from_pem_files(CERT, KEY).unwrap();
    let acceptor = start_broker(Arc::new(answering_broker), Some(identity));
    let (worker, _events) = Recorder::new();
    let config = ConnectorConfig::new("localhost", acceptor.local_addr().port())
        .with_tls(TrustPolicy::pinned_ca_file(CA).unwrap());
    let mut connector = Connector::new(config, worker);
    let channel = connector.connect().unwrap();

    let reply = channel
        .send_message_with_reply(Message::fetch_entry("clientA", "k1"), WAIT)
        .unwrap();
    assert_eq!(reply.key(), Some("k1"));

    let payload = vec![7u8; 256 * 1024];
    let reply = channel
        .send_message_with_reply(Message::put_entry("clientA", "big", payload, 0), WAIT)
        .unwrap();
    assert_eq!(reply.kind(), MessageType::Ack);
}

#[test]
fn tls_large_frames_flow_both_ways_at_once() {
    const REQUESTS: usize = 3;
    const PAYLOAD: usize = 6 * 1024 * 1024;

    // Every PUT_ENTRY is echoed back whole, so both ends write big frames together.
    let echo = |channel: &Channel, message: Message| {
        let reply = Message::put_entry(
            "broker",
            message.key().unwrap_or_default(),
            message.data().unwrap_or_default().to_vec(),
            message.expire_time().unwrap_or_default(),
        );
        channel.send_reply_message(&message, reply).unwrap();
    };
    let identity = ServerIdentity::from_pem_files(CERT, KEY).unwrap();
    let config = AcceptorConfig::new("127.0.0.1:0".parse().unwrap())
        .with_identity(identity)
        .with_socket_timeout_millis(30_000);
    let acceptor = start_broker_with(config, Arc::new(echo));

    let (worker, _events) = Recorder::new();
    let config = ConnectorConfig::new("localhost", acceptor.local_addr().port())
        .with_tls(TrustPolicy::pinned_ca_file(CA).unwrap())
        .with_socket_timeout_millis(30_000);
    let mut connector = Connector::new(config, worker);
    let channel = connector.connect().unwrap();

    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    for i in 0..REQUESTS {
        let tx = tx.clone();
        let payload = vec![i as u8; PAYLOAD];
        channel.send_message_with_async_reply(
            Message::put_entry("clientA", format!("big-{i}"), payload, 0),
            move |original, reply| tx.send((original, reply)).unwrap(),
        );
    }

    for _ in 0..REQUESTS {
        let (original, reply) = rx.recv_timeout(Duration::from_secs(60)).unwrap();
        let reply = reply.unwrap();
        assert_eq!(reply.key(), original.key());
        assert_eq!(reply.data(), original.data());
    }
    assert!(started.elapsed() < Duration::from_secs(25));
    assert!(channel.is_valid());
}

#[test]
fn silent_broker_trips_socket_timeout() {
    let acceptor = start_broker(Arc::new(silent_broker), None);
    let (worker, events) = Recorder::new();
    let config = worker_config(&acceptor).with_socket_timeout_millis(200);
    let mut connector = Connector::new(config, worker);
    let channel = connector.connect().unwrap();

    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    channel.send_message_with_async_reply(Message::fetch_entry("clientA", "k1"), move |_, res| {
        tx.send(res).unwrap()
    });

    match rx.recv_timeout(WAIT).unwrap() {
        Err(ChannelError::Transport(e)) => assert!(matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(!channel.is_valid());
    assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Failed));
}

#[test]
fn tls_insecure_opt_in() {
    let identity = ServerIdentity::from_pem_files(CERT, KEY).unwrap();
    let acceptor = start_broker(Arc::new(answering_broker), Some(identity));
    let (worker, _events) = Recorder::new();
    let config = worker_config(&acceptor).with_tls(TrustPolicy::Insecure);
    let mut connector = Connector::new(config, worker);
    let channel = connector.connect().unwrap();

    let reply = channel
        .send_message_with_reply(Message::unregister_entry("clientA", "k1"), WAIT)
        .unwrap();
    assert_eq!(reply.kind(), MessageType::Ack);
}

#[test]
fn tls_with_untrusted_certificate_fails_to_connect() {
    let identity = ServerIdentity::from_pem_files(CERT, KEY).unwrap();
    let acceptor = start_broker(Arc::new(answering_broker), Some(identity));
    let (worker, _events) = Recorder::new();
    let roots = Arc::new(rustls::RootCertStore::empty());
    let config = ConnectorConfig::new("localhost", acceptor.local_addr().port())
        .with_tls(TrustPolicy::Roots(roots));
    let mut connector = Connector::new(config, worker);

    assert!(matches!(
        connector.connect(),
        Err(ChannelError::Connect { .. })
    ));
    assert!(connector.channel().is_none());
}
