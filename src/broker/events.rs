//! Diagnostic event stream
//!
//! Everything a control panel wants to display goes through `EventSink`:
//! connects, disconnects, inbound packets, publishes and errors. Events are
//! observational only. Emitting never blocks and never fails, whether or not
//! anyone is listening, and every event is mirrored to `tracing`.

use std::net::SocketAddr;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::client::{ConnectionId, TransportKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEvent {
    Info {
        at: i64,
        message: String,
    },
    Error {
        at: i64,
        message: String,
    },
    ClientConnect {
        at: i64,
        id: ConnectionId,
        transport: TransportKind,
        peer: SocketAddr,
    },
    ClientDisconnect {
        at: i64,
        id: ConnectionId,
        transport: TransportKind,
        peer: SocketAddr,
    },
    MessageIn {
        at: i64,
        id: ConnectionId,
        transport: TransportKind,
        packet: Value,
    },
    Published {
        at: i64,
        topic: String,
        data: Value,
        delivered: usize,
    },
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: BrokerEvent) {
        // Err only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.emit(BrokerEvent::Info { at: now_ms(), message });
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.emit(BrokerEvent::Error { at: now_ms(), message });
    }

    pub fn client_connect(&self, id: ConnectionId, transport: TransportKind, peer: SocketAddr) {
        info!(%id, %transport, %peer, "client connected");
        self.emit(BrokerEvent::ClientConnect {
            at: now_ms(),
            id,
            transport,
            peer,
        });
    }

    pub fn client_disconnect(&self, id: ConnectionId, transport: TransportKind, peer: SocketAddr) {
        info!(%id, %transport, %peer, "client disconnected");
        self.emit(BrokerEvent::ClientDisconnect {
            at: now_ms(),
            id,
            transport,
            peer,
        });
    }

    pub fn message_in(&self, id: ConnectionId, transport: TransportKind, packet: &Value) {
        debug!(%id, %transport, "in: {packet}");
        self.emit(BrokerEvent::MessageIn {
            at: now_ms(),
            id,
            transport,
            packet: packet.clone(),
        });
    }

    pub fn published(&self, topic: &str, data: &Value, delivered: usize) {
        debug!(topic, delivered, "published");
        self.emit(BrokerEvent::Published {
            at: now_ms(),
            topic: topic.to_string(),
            data: data.clone(),
            delivered,
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
