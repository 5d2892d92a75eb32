//! The `client` module defines how a connection is represented.
//!
//! `Client` is the broker-side handle for a line-transport session,
//! `ConnectionId` names a session on either transport, and `remote` holds the
//! one-shot outbound client used from the command line.

pub mod pubsub_client;
pub mod remote;

pub use pubsub_client::{Client, ConnectionId, ConnectionSnapshot, TransportKind};
