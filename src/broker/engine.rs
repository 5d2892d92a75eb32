//! Broker engine
//!
//! Owns the line-transport subscription index, the connection registry and
//! the list of external publishers, all behind one lock ("the registry
//! lock"). Responsibilities:
//! - interpret SUB / UNSUB / PUB packets for line connections
//! - fan a publish out to matching line subscribers, then to every bridge
//! - drop a connection and all of its subscriptions in one step
//!
//! Locking rules: the lock is held for index/registry reads and writes only.
//! Publish snapshots the target senders and the bridge list under the lock,
//! releases it, and only then pushes to subscribers and calls bridges.
//! Delivery is fire-and-forget: a subscriber whose writer is gone, or whose
//! outbound queue is full because it stopped reading, is removed and the
//! publish carries on with the others.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;

use crate::broker::events::{BrokerEvent, EventSink};
use crate::broker::message::{Message, ServerMessage};
use crate::broker::registry::ConnectionRegistry;
use crate::broker::topic::{SubscriptionIndex, WildcardMode};
use crate::client::{Client, ConnectionId, ConnectionSnapshot, TransportKind};
use crate::config::BrokerSettings;
use crate::transport::bridge::ExternalPublisher;
use crate::transport::packet::Packet;
use crate::utils::RegisterError;

struct BrokerState {
    index: SubscriptionIndex,
    registry: ConnectionRegistry,
    bridges: Vec<Arc<dyn ExternalPublisher>>,
    accepting: bool,
}

pub struct Broker {
    state: Mutex<BrokerState>,
    events: EventSink,
    send_queue: usize,
    write_timeout: Duration,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Broker")
            .field("connections", &state.registry.len())
            .field("topics", &state.index.topic_count())
            .field("bridges", &state.bridges.len())
            .finish()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(&BrokerSettings::default())
    }
}

impl Broker {
    /// Empty broker configured from `settings`. Accepts registrations
    /// right away.
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                index: SubscriptionIndex::new(settings.wildcard),
                registry: ConnectionRegistry::new(settings.max_connections),
                bridges: Vec::new(),
                accepting: true,
            }),
            events: EventSink::new(settings.event_capacity),
            send_queue: settings.send_queue.max(1),
            write_timeout: Duration::from_millis(settings.write_timeout_ms.max(1)),
        }
    }

    /// Capacity of each connection's outbound queue, on both transports.
    pub fn send_queue(&self) -> usize {
        self.send_queue
    }

    /// How long one socket write may stall before the connection is
    /// considered dead.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// A new receiver on the diagnostic event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn wildcard_mode(&self) -> WildcardMode {
        self.state.lock().index.mode()
    }

    /// Allow registrations again after [`Broker::close_all`].
    pub fn open(&self) {
        self.state.lock().accepting = true;
    }

    /// Admits a line connection and emits `client_connect`. A refused
    /// client is closed before the error is returned.
    pub fn register_client(&self, client: Client) -> Result<ConnectionId, RegisterError> {
        let peer = client.peer;
        let outcome = {
            let mut state = self.state.lock();
            if state.accepting {
                state.registry.register(client)
            } else {
                Err((client, RegisterError::Stopping(peer)))
            }
        };
        match outcome {
            Ok(id) => {
                self.events.client_connect(id, TransportKind::Line, peer);
                Ok(id)
            }
            Err((client, err)) => {
                client.close();
                Err(err)
            }
        }
    }

    /// Unregisters the client and drops every subscription it held, as one
    /// step under the lock. The socket is shut down afterwards so a blocked
    /// reader wakes up. Returns `false` if the client was already gone.
    pub fn cleanup_client(&self, id: &ConnectionId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let client = state.registry.unregister(id);
            let held = state.index.remove_connection(id);
            client.map(|c| (c, held))
        };
        match removed {
            Some((client, held)) => {
                tracing::debug!(%id, ?held, "removed connection");
                client.close();
                true
            }
            None => false,
        }
    }

    /// Ignored for connections that are not (or no longer) registered.
    pub fn subscribe(&self, topic: &str, id: ConnectionId) -> bool {
        let mut state = self.state.lock();
        if !state.registry.contains(&id) {
            return false;
        }
        state.index.subscribe(topic, id);
        true
    }

    /// No-op if the pair is absent.
    pub fn unsubscribe(&self, topic: &str, id: &ConnectionId) -> bool {
        self.state.lock().index.unsubscribe(topic, id)
    }

    /// Applies one decoded packet from line connection `id`. SUB is
    /// acknowledged to the sender, unknown actions are reported.
    pub fn handle_packet(&self, id: ConnectionId, packet: Packet) {
        match packet {
            Packet::Subscribe { topic } => {
                if self.subscribe(&topic, id) {
                    self.events.info(format!("{id} subscribed {topic}"));
                    self.send_to(&id, &ServerMessage::subscribed(&topic));
                }
            }
            Packet::Unsubscribe { topic } => {
                self.unsubscribe(&topic, &id);
                self.events.info(format!("{id} unsubscribed {topic}"));
            }
            Packet::Publish { topic, data } => {
                self.publish(&topic, data, Some(id));
            }
            Packet::Unrecognized { action } => {
                self.events.error(format!("Unknown action from {id}: {action}"));
            }
        }
    }

    /// Best-effort write to one connection. A dead writer gets the
    /// connection removed.
    pub fn send_to(&self, id: &ConnectionId, msg: &ServerMessage) -> bool {
        let sender = self.state.lock().registry.get(id).map(|c| c.sender.clone());
        let Some(sender) = sender else {
            return false;
        };
        self.offer(id, &sender, msg.to_line())
    }

    /// Non-blocking push onto one connection's queue. A closed or full
    /// queue gets the connection removed.
    fn offer(&self, id: &ConnectionId, sender: &Sender<String>, line: String) -> bool {
        match sender.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.events
                    .error(format!("{id} is not reading (queue full), dropping it"));
                self.cleanup_client(id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.events.error(format!("Send to {id} failed, dropping it"));
                self.cleanup_client(id);
                false
            }
        }
    }

    /// Fans `data` out to every line subscriber matching `topic` except
    /// `origin`, then hands the message to every registered bridge.
    ///
    /// Returns how many line subscribers accepted the message. Never fails:
    /// dead subscribers are removed, bridge errors are reported as events.
    pub fn publish(&self, topic: &str, data: Value, origin: Option<ConnectionId>) -> usize {
        let message = Message::new(topic, data, origin);

        let (targets, bridges) = {
            let state = self.state.lock();
            let targets: Vec<(ConnectionId, Sender<String>)> = state
                .index
                .matching(topic)
                .into_iter()
                .filter(|id| Some(*id) != origin)
                .filter_map(|id| state.registry.get(&id).map(|c| (id, c.sender.clone())))
                .collect();
            (targets, state.bridges.clone())
        };

        let line = message.envelope().to_line();
        let mut delivered = 0;
        for (id, sender) in targets {
            if self.offer(&id, &sender, line.clone()) {
                delivered += 1;
            }
        }

        for bridge in bridges {
            if let Err(e) = bridge.publish(&message) {
                self.events
                    .error(format!("External publisher '{}' error: {e}", bridge.name()));
            }
        }

        self.events.published(topic, &message.data, delivered);
        delivered
    }

    /// Adds a bridge that sees every publish from now on.
    pub fn register_external_publisher(&self, publisher: Arc<dyn ExternalPublisher>) {
        self.state.lock().bridges.push(publisher);
    }

    /// Removes bridges named `name`. Returns whether any was removed.
    pub fn remove_external_publisher(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.bridges.len();
        state.bridges.retain(|b| b.name() != name);
        state.bridges.len() != before
    }

    /// Every registered connection with its subscriptions, taken atomically.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        let state = self.state.lock();
        let mut snaps: Vec<ConnectionSnapshot> = state
            .registry
            .iter()
            .map(|c| ConnectionSnapshot {
                id: c.id,
                peer: c.peer,
                transport: TransportKind::Line,
                topics: state.index.topics_for(&c.id),
            })
            .collect();
        snaps.sort_by_key(|s| s.peer);
        snaps
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn topic_count(&self) -> usize {
        self.state.lock().index.topic_count()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().index.contains_topic(topic)
    }

    pub fn is_subscribed(&self, topic: &str, id: &ConnectionId) -> bool {
        self.state.lock().index.is_subscribed(topic, id)
    }

    /// Stop accepting registrations, forget every connection and
    /// subscription, and force the sockets closed. Returns how many
    /// connections were closed.
    pub fn close_all(&self) -> usize {
        let clients = {
            let mut state = self.state.lock();
            state.accepting = false;
            state.index.clear();
            state.registry.drain()
        };
        for client in &clients {
            client.close();
        }
        clients.len()
    }
}
