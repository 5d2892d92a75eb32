//! # relaysub
//!
//! `relaysub` is a small publish/subscribe broker. Clients connect over
//! newline-delimited JSON on TCP or over WebSocket text frames, subscribe to
//! topics (exact, or a `prefix/#` wildcard) and publish arbitrary JSON. A
//! message published on either transport reaches matching subscribers on
//! both, never echoing back to the connection that sent it.
//!
//! ## Modules
//!
//! - `broker`: subscription index, connection registry, publish fan-out and
//!   the diagnostic event stream.
//! - `client`: connection identity, the per-connection send handle, and a
//!   one-shot outbound client.
//! - `config`: settings loaded from file and environment.
//! - `transport`: the line and frame servers and the bridge between them.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::Broker;
pub use transport::{FrameServer, LineServer};
