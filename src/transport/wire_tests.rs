//! End-to-end tests over real sockets on 127.0.0.1.

use super::frame::FrameServer;
use super::line::LineServer;
use crate::broker::{Broker, BrokerEvent};
use crate::client::TransportKind;
use crate::config::BrokerSettings;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(3);
const POLL: Duration = Duration::from_millis(50);

fn start_line() -> (Arc<Broker>, LineServer) {
    start_line_with(&BrokerSettings::default())
}

fn start_line_with(settings: &BrokerSettings) -> (Arc<Broker>, LineServer) {
    let broker = Arc::new(Broker::new(settings));
    let server = LineServer::start(broker.clone(), "127.0.0.1:0", POLL).unwrap();
    (broker, server)
}

/// Small queues and a short write timeout so a stalled reader is noticed fast.
fn impatient() -> BrokerSettings {
    BrokerSettings {
        send_queue: 8,
        write_timeout_ms: 100,
        ..BrokerSettings::default()
    }
}

fn big_blob() -> Value {
    json!("x".repeat(100 * 1024))
}

fn error_messages(events: &mut tokio::sync::broadcast::Receiver<BrokerEvent>) -> Vec<String> {
    std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            BrokerEvent::Error { message, .. } => Some(message),
            _ => None,
        })
        .collect()
}

struct LineClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl LineClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    fn send_raw(&mut self, raw: &str) {
        self.stream.write_all(raw.as_bytes()).unwrap();
    }

    fn send(&mut self, packet: Value) {
        self.send_raw(&format!("{packet}\n"));
    }

    fn recv(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        assert!(line.ends_with('\n'), "short read: {line:?}");
        serde_json::from_str(&line).unwrap()
    }

    fn subscribe(&mut self, topic: &str) {
        self.send(json!({"action": "SUB", "topic": topic}));
        assert_eq!(self.recv(), json!({"topic": topic, "status": "subscribed"}));
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(POLL);
    }
}

#[test]
fn test_line_subscribe_then_publish() {
    let (_broker, server) = start_line();
    let mut c1 = LineClient::connect(server.local_addr());
    let mut c2 = LineClient::connect(server.local_addr());

    c1.subscribe("a/b");
    c2.send(json!({"action": "PUB", "topic": "a/b", "data": {"x": 1}}));

    assert_eq!(c1.recv(), json!({"topic": "a/b", "data": {"x": 1}}));
}

#[test]
fn test_line_wildcard() {
    let (_broker, server) = start_line();
    let mut c1 = LineClient::connect(server.local_addr());
    let mut c2 = LineClient::connect(server.local_addr());

    c1.subscribe("a/#");
    c2.send(json!({"action": "PUB", "topic": "z", "data": 0}));
    c2.send(json!({"action": "PUB", "topic": "a/b/c", "data": 1}));

    // "z" never arrives, so the first line is the wildcard match
    assert_eq!(c1.recv(), json!({"topic": "a/b/c", "data": 1}));
}

#[test]
fn test_line_malformed_packet_keeps_connection_usable() {
    let (broker, server) = start_line();
    let mut events = broker.subscribe_events();
    let mut c1 = LineClient::connect(server.local_addr());

    c1.send_raw("{bad\n");
    c1.subscribe("t");
    assert_eq!(broker.connection_count(), 1);

    assert!(error_messages(&mut events).iter().any(|m| m.contains("Invalid JSON")));
}

#[test]
fn test_line_malformed_line_from_one_subscriber_does_not_affect_delivery() {
    let (broker, server) = start_line();
    let mut c1 = LineClient::connect(server.local_addr());
    let mut c2 = LineClient::connect(server.local_addr());
    let mut c3 = LineClient::connect(server.local_addr());

    c1.subscribe("a/b");
    c2.subscribe("a/b");
    c2.send_raw("{bad\n");
    c3.send(json!({"action": "PUB", "topic": "a/b", "data": "both"}));

    assert_eq!(c1.recv(), json!({"topic": "a/b", "data": "both"}));
    assert_eq!(c2.recv(), json!({"topic": "a/b", "data": "both"}));
    assert_eq!(broker.connection_count(), 3);
}

#[test]
fn test_line_subscriber_that_stops_reading_is_evicted() {
    let (broker, server) = start_line_with(&impatient());
    let mut stuck = LineClient::connect(server.local_addr());
    stuck.subscribe("big");
    wait_until(|| broker.connection_count() == 1);

    let blob = big_blob();
    for _ in 0..500 {
        broker.publish("big", blob.clone(), None);
    }
    wait_until(|| broker.connection_count() == 0);
    assert_eq!(broker.publish("big", json!("later"), None), 0);
    assert!(!broker.has_topic("big"));
}

#[test]
fn test_line_packets_split_across_writes() {
    let (_broker, server) = start_line();
    let mut c1 = LineClient::connect(server.local_addr());

    c1.send_raw("{\"action\":\"SUB\",");
    std::thread::sleep(POLL);
    c1.send_raw("\"topic\":\"s\"}\n{\"action\":\"PUB\",\"topic\":\"s\",\"data\":1}\n");
    assert_eq!(c1.recv(), json!({"topic": "s", "status": "subscribed"}));
}

#[test]
fn test_line_abrupt_disconnect_is_cleaned_up() {
    let (broker, server) = start_line();
    let mut gone = LineClient::connect(server.local_addr());
    let mut stays = LineClient::connect(server.local_addr());
    let mut publisher = LineClient::connect(server.local_addr());

    gone.subscribe("t");
    stays.subscribe("t");
    wait_until(|| broker.connection_count() == 3);

    drop(gone);
    wait_until(|| broker.connection_count() == 2);

    publisher.send(json!({"action": "PUB", "topic": "t", "data": "after"}));
    assert_eq!(stays.recv(), json!({"topic": "t", "data": "after"}));
    assert_eq!(broker.connections().iter().filter(|s| !s.topics.is_empty()).count(), 1);
}

#[test]
fn test_line_stop_closes_connections() {
    let (broker, mut server) = start_line();
    let mut c1 = LineClient::connect(server.local_addr());
    c1.subscribe("t");

    server.stop();
    assert!(!server.is_running());
    assert_eq!(broker.connection_count(), 0);

    let mut line = String::new();
    // EOF or reset, either way no more data
    let read = c1.reader.read_line(&mut line).unwrap_or(0);
    assert_eq!(read, 0);

    // stop is idempotent
    server.stop();
}

#[test]
fn test_line_bind_failure() {
    let (_broker, server) = start_line();
    let taken = server.local_addr().to_string();
    let err = LineServer::start(Arc::new(Broker::default()), &taken, POLL);
    assert!(err.is_err());
}

// --- cross transport ---

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn ws_connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

async fn ws_send(ws: &mut Ws, packet: Value) {
    ws.send(WsMessage::text(packet.to_string())).await.unwrap();
}

async fn ws_recv(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("frame timeout")
            .expect("stream ended")
            .unwrap();
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

struct AsyncLine {
    reader: tokio::io::BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl AsyncLine {
    async fn connect(addr: SocketAddr) -> Self {
        Self::from_stream(tokio::net::TcpStream::connect(addr).await.unwrap())
    }

    /// A client whose drop resets the connection instead of closing it.
    #[allow(deprecated)]
    async fn connect_resetting(addr: SocketAddr) -> Self {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        Self::from_stream(stream)
    }

    fn from_stream(stream: tokio::net::TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: tokio::io::BufReader::new(r),
            writer: w,
        }
    }

    async fn send(&mut self, packet: Value) {
        self.writer
            .write_all(format!("{packet}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("line timeout")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(POLL).await;
    }
}

fn frame_peers(frame: &FrameServer) -> usize {
    tokio::task::block_in_place(|| frame.connections()).unwrap().len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_line_reset_connection_is_cleaned_up() {
    let (broker, server) = start_line();
    let mut events = broker.subscribe_events();
    let mut gone = AsyncLine::connect_resetting(server.local_addr()).await;
    let mut stays = AsyncLine::connect(server.local_addr()).await;
    let mut publisher = AsyncLine::connect(server.local_addr()).await;

    for c in [&mut gone, &mut stays] {
        c.send(json!({"action": "SUB", "topic": "a/b"})).await;
        assert_eq!(c.recv().await, json!({"topic": "a/b", "status": "subscribed"}));
    }
    eventually(|| broker.connection_count() == 3).await;

    drop(gone);
    eventually(|| broker.connection_count() == 2).await;

    publisher
        .send(json!({"action": "PUB", "topic": "a/b", "data": "after reset"}))
        .await;
    assert_eq!(stays.recv().await, json!({"topic": "a/b", "data": "after reset"}));
    // a reset is an ordinary disconnect, not a read error
    assert!(!error_messages(&mut events).iter().any(|m| m.contains("read error")));
    tokio::task::block_in_place(move || drop(server));
}

fn start_both() -> (Arc<Broker>, LineServer, FrameServer) {
    start_both_with(&BrokerSettings::default())
}

fn start_both_with(settings: &BrokerSettings) -> (Arc<Broker>, LineServer, FrameServer) {
    let broker = Arc::new(Broker::new(settings));
    let line = LineServer::start(broker.clone(), "127.0.0.1:0", POLL).unwrap();
    let frame = FrameServer::start(broker.clone(), "127.0.0.1:0").unwrap();
    (broker, line, frame)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_line_publish_reaches_frame_subscriber() {
    let (_broker, line, frame) = start_both();
    let mut ws = ws_connect(frame.local_addr()).await;
    let mut publisher = AsyncLine::connect(line.local_addr()).await;

    ws_send(&mut ws, json!({"action": "SUB", "topic": "x"})).await;
    assert_eq!(ws_recv(&mut ws).await, json!({"topic": "x", "status": "subscribed"}));

    publisher
        .send(json!({"action": "PUB", "topic": "x", "data": [1, "two"]}))
        .await;
    assert_eq!(ws_recv(&mut ws).await, json!({"topic": "x", "data": [1, "two"]}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_publish_reaches_line_and_frame_subscribers() {
    let (_broker, line, frame) = start_both();
    let mut sub = AsyncLine::connect(line.local_addr()).await;
    let mut ws_sub = ws_connect(frame.local_addr()).await;
    let mut ws_pub = ws_connect(frame.local_addr()).await;

    sub.send(json!({"action": "SUB", "topic": "y/#"})).await;
    assert_eq!(sub.recv().await, json!({"topic": "y/#", "status": "subscribed"}));
    ws_send(&mut ws_sub, json!({"action": "sub", "topic": "y/1"})).await;
    assert_eq!(ws_recv(&mut ws_sub).await, json!({"topic": "y/1", "status": "subscribed"}));
    ws_send(&mut ws_pub, json!({"action": "SUB", "topic": "y/1"})).await;
    assert_eq!(ws_recv(&mut ws_pub).await, json!({"topic": "y/1", "status": "subscribed"}));

    ws_send(&mut ws_pub, json!({"action": "PUB", "topic": "y/1", "data": {"k": true}})).await;
    assert_eq!(sub.recv().await, json!({"topic": "y/1", "data": {"k": true}}));
    assert_eq!(ws_recv(&mut ws_sub).await, json!({"topic": "y/1", "data": {"k": true}}));

    // the publisher is subscribed too, but never hears its own message:
    // the next thing it gets is someone else's publish
    ws_send(&mut ws_sub, json!({"action": "PUB", "topic": "y/1", "data": 2})).await;
    assert_eq!(ws_recv(&mut ws_pub).await, json!({"topic": "y/1", "data": 2}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_connections_snapshot_and_stop() {
    let (broker, _line, mut frame) = start_both();
    let mut ws = ws_connect(frame.local_addr()).await;
    ws_send(&mut ws, json!({"action": "SUB", "topic": "a/#"})).await;
    ws_recv(&mut ws).await;

    let snaps = tokio::task::block_in_place(|| frame.connections()).unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].transport, TransportKind::Frame);
    assert_eq!(snaps[0].topics, vec!["a/#".to_string()]);

    tokio::task::block_in_place(|| frame.stop());
    assert!(!frame.is_running());
    // the bridge is gone, publishing still works
    assert_eq!(broker.publish("a/b", json!(1), None), 0);
    assert!(frame.connections().is_err());

    // the server side closed the socket
    let end = tokio::time::timeout(WAIT, ws.next()).await.expect("close timeout");
    assert!(!matches!(end, Some(Ok(WsMessage::Text(_)))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_malformed_json_keeps_connection_usable() {
    let (broker, _line, frame) = start_both();
    let mut events = broker.subscribe_events();
    let mut ws = ws_connect(frame.local_addr()).await;

    ws.send(WsMessage::text("{bad")).await.unwrap();
    ws_send(&mut ws, json!({"action": "SUB", "topic": "t"})).await;
    assert_eq!(ws_recv(&mut ws).await, json!({"topic": "t", "status": "subscribed"}));

    assert!(error_messages(&mut events).iter().any(|m| m.contains("Invalid JSON")));
    assert_eq!(frame_peers(&frame), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_disconnect_drops_subscriptions() {
    let (broker, line, frame) = start_both();
    let mut gone = ws_connect(frame.local_addr()).await;
    let mut stays = ws_connect(frame.local_addr()).await;
    let mut publisher = AsyncLine::connect(line.local_addr()).await;

    for ws in [&mut gone, &mut stays] {
        ws_send(ws, json!({"action": "SUB", "topic": "a/b"})).await;
        assert_eq!(ws_recv(ws).await, json!({"topic": "a/b", "status": "subscribed"}));
    }
    assert_eq!(frame_peers(&frame), 2);

    gone.close(None).await.unwrap();
    drop(gone);
    eventually(|| frame_peers(&frame) == 1).await;

    publisher
        .send(json!({"action": "PUB", "topic": "a/b", "data": 7}))
        .await;
    assert_eq!(ws_recv(&mut stays).await, json!({"topic": "a/b", "data": 7}));
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_unsubscribe_stops_delivery() {
    let (_broker, line, frame) = start_both();
    let mut ws = ws_connect(frame.local_addr()).await;
    let mut publisher = AsyncLine::connect(line.local_addr()).await;

    for topic in ["old", "new"] {
        ws_send(&mut ws, json!({"action": "SUB", "topic": topic})).await;
        assert_eq!(ws_recv(&mut ws).await, json!({"topic": topic, "status": "subscribed"}));
    }
    ws_send(&mut ws, json!({"action": "UNSUB", "topic": "old"})).await;
    eventually(|| {
        tokio::task::block_in_place(|| frame.connections()).unwrap()[0].topics
            == vec!["new".to_string()]
    })
    .await;

    publisher.send(json!({"action": "PUB", "topic": "old", "data": 1})).await;
    publisher.send(json!({"action": "PUB", "topic": "new", "data": 2})).await;
    // publishes reach the loop in order, so "old" would have arrived first
    assert_eq!(ws_recv(&mut ws).await, json!({"topic": "new", "data": 2}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_subscriber_that_stops_reading_is_evicted() {
    let (broker, _line, frame) = start_both_with(&impatient());
    let mut stuck = ws_connect(frame.local_addr()).await;
    ws_send(&mut stuck, json!({"action": "SUB", "topic": "big"})).await;
    assert_eq!(ws_recv(&mut stuck).await, json!({"topic": "big", "status": "subscribed"}));

    let blob = big_blob();
    let publisher = broker.clone();
    tokio::task::spawn_blocking(move || {
        for _ in 0..500 {
            publisher.publish("big", blob.clone(), None);
        }
    })
    .await
    .unwrap();

    eventually(|| frame_peers(&frame) == 0).await;
    drop(stuck);
}
