//! The `error` module defines the error types used within `relaysub`.
//!
//! Only start-up failures ever reach a caller as `BrokerError`. Everything that
//! goes wrong on a live connection is handled where it happens and surfaces as
//! a diagnostic event instead.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start event loop: {0}")]
    Runtime(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A frame or line that could not be turned into a packet.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("packet is not a json object")]
    NotAnObject,
}

/// Failure to hand work to a foreign execution context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("event loop is not running")]
    LoopStopped,

    #[error("event loop dropped the reply")]
    NoReply,
}

/// Refusal to admit a connection into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("connection limit of {0} reached")]
    Limit(usize),

    #[error("connection from {0} rejected: broker is stopping")]
    Stopping(SocketAddr),
}
