//! Frame transport (WebSocket)
//!
//! Runs on its own thread with a current-thread tokio runtime and a
//! `LocalSet`, i.e. one cooperative event loop. Every connection is a local
//! task; they share a `FrameHub` through `Rc<RefCell<_>>`, which is sound
//! because only one task runs at a time and no borrow is held across an
//! await.
//!
//! Each peer has a bounded outbound queue drained by its own writer task,
//! and every socket write is capped by the broker's write timeout. A peer
//! whose queue fills up, or whose write stalls, is dropped.
//!
//! SUB and UNSUB only touch the hub's own index. PUB is handed to the
//! broker's publish (on the blocking pool, so the loop keeps running), which
//! reaches line subscribers directly and comes back here through the
//! `FrameBridge`: a task submitted to the loop that matches against the
//! hub's index and queues the frame for each subscriber.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinSet, LocalSet};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::events::EventSink;
use crate::broker::message::{Message, ServerMessage};
use crate::broker::topic::{SubscriptionIndex, WildcardMode};
use crate::broker::Broker;
use crate::client::{ConnectionId, ConnectionSnapshot, TransportKind};
use crate::transport::bridge::{ExternalPublisher, LoopHandle, LoopQueue, loop_channel};
use crate::transport::line::decode_line;
use crate::transport::packet::{self, Packet};
use crate::utils::{BridgeError, BrokerError};

/// How long shutdown waits for connection tasks to wind down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct FramePeer {
    peer: SocketAddr,
    sender: mpsc::Sender<WsMessage>,
}

/// Loop-owned state: frame connections and their subscriptions.
#[derive(Debug)]
pub struct FrameHub {
    index: SubscriptionIndex,
    peers: HashMap<ConnectionId, FramePeer>,
    events: EventSink,
}

impl FrameHub {
    pub fn new(mode: WildcardMode, events: EventSink) -> Self {
        Self {
            index: SubscriptionIndex::new(mode),
            peers: HashMap::new(),
            events,
        }
    }

    /// Track a new connection. `sender` feeds its writer task.
    pub fn add_peer(
        &mut self,
        id: ConnectionId,
        peer: SocketAddr,
        sender: mpsc::Sender<WsMessage>,
    ) {
        self.peers.insert(id, FramePeer { peer, sender });
    }

    /// Drops the peer and all of its subscriptions. Dropping the sender lets
    /// the connection's writer finish and close the socket.
    pub fn remove_peer(&mut self, id: &ConnectionId) -> bool {
        self.index.remove_connection(id);
        self.peers.remove(id).is_some()
    }

    /// Idempotent. Ignored for peers that are not (or no longer) tracked.
    pub fn subscribe(&mut self, topic: &str, id: ConnectionId) -> bool {
        if !self.peers.contains_key(&id) {
            return false;
        }
        self.index.subscribe(topic, id);
        true
    }

    pub fn unsubscribe(&mut self, topic: &str, id: &ConnectionId) -> bool {
        self.index.unsubscribe(topic, id)
    }

    /// Queue one frame for `id`. A full or closed queue drops the peer.
    pub fn send_to(&mut self, id: &ConnectionId, msg: &ServerMessage) -> bool {
        self.offer(id, WsMessage::text(msg.to_json()))
    }

    fn offer(&mut self, id: &ConnectionId, frame: WsMessage) -> bool {
        let Some(p) = self.peers.get(id) else {
            return false;
        };
        let reason = match p.sender.try_send(frame) {
            Ok(()) => return true,
            Err(TrySendError::Full(_)) => "is not reading (queue full)",
            Err(TrySendError::Closed(_)) => "send failed",
        };
        self.events
            .error(format!("Frame peer {id} {reason}, dropping it"));
        self.remove_peer(id);
        false
    }

    /// Queue `message` for every matching frame subscriber except its origin.
    pub fn deliver(&mut self, message: &Message) -> usize {
        let text = message.envelope().to_json();
        let targets: Vec<ConnectionId> = self
            .index
            .matching(&message.topic)
            .into_iter()
            .filter(|id| Some(*id) != message.origin)
            .collect();

        let mut delivered = 0;
        for id in targets {
            if self.offer(&id, WsMessage::text(text.clone())) {
                delivered += 1;
            }
        }
        debug!(topic = %message.topic, delivered, "frame fan-out");
        delivered
    }

    /// Every peer with its subscriptions, ordered by address.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut snaps: Vec<ConnectionSnapshot> = self
            .peers
            .iter()
            .map(|(id, p)| ConnectionSnapshot {
                id: *id,
                peer: p.peer,
                transport: TransportKind::Frame,
                topics: self.index.topics_for(id),
            })
            .collect();
        snaps.sort_by_key(|s| s.peer);
        snaps
    }

    /// Forget every peer. Dropping the senders ends their writer tasks.
    pub fn clear(&mut self) {
        self.index.clear();
        self.peers.clear();
    }
}

/// Broker-side end of the bridge: turns every publish into a task on the
/// frame loop.
pub struct FrameBridge {
    name: String,
    handle: LoopHandle<FrameHub>,
}

impl FrameBridge {
    pub fn new(name: impl Into<String>, handle: LoopHandle<FrameHub>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }
}

impl ExternalPublisher for FrameBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, message: &Message) -> Result<(), BridgeError> {
        let message = message.clone();
        self.handle.submit(move |hub| {
            hub.deliver(&message);
        })
    }
}

pub struct FrameServer {
    broker: Arc<Broker>,
    handle: LoopHandle<FrameHub>,
    bridge_name: String,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FrameServer {
    /// Binds `addr`, starts the event loop thread and bridges it into
    /// `broker`. Returns once the loop is accepting.
    pub fn start(broker: Arc<Broker>, addr: &str) -> Result<Self, BrokerError> {
        let listener = StdTcpListener::bind(addr).map_err(|source| BrokerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (handle, queue) = loop_channel::<FrameHub>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let hub = FrameHub::new(broker.wildcard_mode(), broker.events().clone());

        let thread = {
            let broker = broker.clone();
            thread::Builder::new()
                .name("frame-loop".to_string())
                .spawn(move || run_loop(listener, broker, hub, queue, shutdown_rx, ready_tx))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(BrokerError::Runtime(reason));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(BrokerError::Runtime("event loop exited during start-up".into()));
            }
        }

        let bridge_name = format!("frame@{local_addr}");
        broker.register_external_publisher(Arc::new(FrameBridge::new(
            bridge_name.clone(),
            handle.clone(),
        )));
        broker
            .events()
            .info(format!("Frame transport listening on {local_addr}"));

        Ok(Self {
            broker,
            handle,
            bridge_name,
            local_addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Frame connections and their subscriptions, read on the loop.
    ///
    /// Blocks the calling thread until the loop answers; do not call it from
    /// the frame loop itself.
    pub fn connections(&self) -> Result<Vec<ConnectionSnapshot>, BridgeError> {
        let (tx, rx) = std_mpsc::channel();
        self.handle.submit(move |hub| {
            let _ = tx.send(hub.snapshot());
        })?;
        rx.recv_timeout(SNAPSHOT_TIMEOUT)
            .map_err(|_| BridgeError::NoReply)
    }

    /// Unhooks the bridge, signals the loop to halt and waits for its thread.
    pub fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        self.broker.remove_external_publisher(&self.bridge_name);
        let _ = shutdown.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                self.broker.events().error("Frame event loop panicked");
            }
        }
        self.broker.events().info("Frame transport stopped");
    }
}

impl Drop for FrameServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    listener: StdTcpListener,
    broker: Arc<Broker>,
    hub: FrameHub,
    queue: LoopQueue<FrameHub>,
    shutdown: oneshot::Receiver<()>,
    ready: std_mpsc::SyncSender<Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        let listener = match TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                let _ = ready.send(Err(e.to_string()));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let hub = Rc::new(RefCell::new(hub));
        let driver = tokio::task::spawn_local(drive(queue, hub.clone()));

        serve(listener, broker, hub.clone(), shutdown).await;

        driver.abort();
        hub.borrow_mut().clear();
    });
    debug!("frame loop finished");
}

/// Runs bridge tasks in submission order.
async fn drive(mut queue: LoopQueue<FrameHub>, hub: Rc<RefCell<FrameHub>>) {
    while let Some(task) = queue.next().await {
        task(&mut *hub.borrow_mut());
    }
}

async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    hub: Rc<RefCell<FrameHub>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tasks.spawn_local(handle_connection(
                        stream,
                        peer,
                        broker.clone(),
                        hub.clone(),
                        stop_rx.clone(),
                    ));
                }
                Err(e) => broker.events().error(format!("Frame accept error: {e}")),
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    let _ = stop_tx.send(true);
    let drained = timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!("frame connections still open after drain timeout, aborting");
        tasks.abort_all();
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    hub: Rc<RefCell<FrameHub>>,
    mut stop: watch::Receiver<bool>,
) {
    let events = broker.events().clone();
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            events.error(format!("WebSocket handshake error from {peer}: {e}"));
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(broker.send_queue());
    let write_timeout = broker.write_timeout();

    let id = ConnectionId::new();
    hub.borrow_mut().add_peer(id, peer, tx);
    events.client_connect(id, TransportKind::Frame, peer);

    // Ends when the hub drops the peer or a write fails or stalls.
    let mut writer = tokio::task::spawn_local(async move {
        while let Some(msg) = rx.recv().await {
            match timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%id, "frame write failed: {e}");
                    break;
                }
                Err(_) => {
                    debug!(%id, "frame write stalled, peer is not reading");
                    break;
                }
            }
        }
        let _ = timeout(write_timeout, ws_sender.close()).await;
    });

    loop {
        let next = tokio::select! {
            _ = stop.changed() => break,
            _ = &mut writer => break,
            next = ws_receiver.next() => next,
        };
        match next {
            Some(Ok(WsMessage::Text(text))) => {
                handle_frame(id, text.as_str(), &broker, &hub).await;
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                handle_frame(id, &decode_line(&bytes), &broker, &hub).await;
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                break;
            }
            Some(Err(e)) => {
                events.error(format!("WS read error {peer}: {e}"));
                break;
            }
        }
    }

    hub.borrow_mut().remove_peer(&id);
    events.client_disconnect(id, TransportKind::Frame, peer);
}

async fn handle_frame(
    id: ConnectionId,
    text: &str,
    broker: &Arc<Broker>,
    hub: &Rc<RefCell<FrameHub>>,
) {
    let events = broker.events();
    let (raw, packet) = match packet::parse(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            events.error(format!("Invalid JSON from WS {id}: {text} ({e})"));
            return;
        }
    };
    events.message_in(id, TransportKind::Frame, &raw);

    match packet {
        Packet::Subscribe { topic } => {
            let subscribed = {
                let mut hub = hub.borrow_mut();
                hub.subscribe(&topic, id) && hub.send_to(&id, &ServerMessage::subscribed(&topic))
            };
            if subscribed {
                events.info(format!("WS {id} subscribed {topic}"));
            }
        }
        Packet::Unsubscribe { topic } => {
            hub.borrow_mut().unsubscribe(&topic, &id);
            events.info(format!("WS {id} unsubscribed {topic}"));
        }
        Packet::Publish { topic, data } => {
            let broker = broker.clone();
            // awaited so one connection's publishes keep their order
            let published =
                tokio::task::spawn_blocking(move || broker.publish(&topic, data, Some(id))).await;
            if let Err(e) = published {
                events.error(format!("Publish from WS {id} failed: {e}"));
            }
        }
        Packet::Unrecognized { action } => {
            events.error(format!("Unknown WS action from {id}: {action}"));
        }
    }
}
