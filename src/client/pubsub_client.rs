//! Client representation
//!
//! `Client` models one live line-transport connection. The broker never
//! writes to the socket itself: it pushes encoded lines into the bounded
//! `sender` queue, and a writer thread owned by the transport drains them in
//! order. The extra
//! socket handle is only used to force the connection closed.

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

/// Identifies one client session on either transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form keeps log lines readable
        let s = self.0.simple().to_string();
        write!(f, "conn-{}", &s[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Line,
    Frame,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Line => f.write_str("line"),
            TransportKind::Frame => f.write_str("frame"),
        }
    }
}

#[derive(Debug)]
pub struct Client {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub sender: Sender<String>,
    socket: Option<TcpStream>,
}

impl Client {
    pub fn new(peer: SocketAddr, sender: Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            sender,
            socket: None,
        }
    }

    /// Attach a handle used by [`Client::close`] to unblock the reader.
    pub fn with_socket(mut self, socket: TcpStream) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Shuts the socket down so a blocked reader wakes up. No-op without a
    /// socket.
    pub fn close(&self) {
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

/// Read-only view of a connection and what it is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub transport: TransportKind,
    pub topics: Vec<String>,
}

impl fmt::Display for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.topics.is_empty() {
            write!(f, "{} {} -> (no subs)", self.transport, self.peer)
        } else {
            write!(f, "{} {} -> {}", self.transport, self.peer, self.topics.join(", "))
        }
    }
}
