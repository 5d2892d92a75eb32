//! The `transport` module is responsible for network communication with
//! clients.
//!
//! Two transports share one packet format:
//! - `line`: newline-delimited JSON over TCP, thread per connection
//! - `frame`: one JSON document per WebSocket text frame, single event loop
//!
//! `bridge` is how a publish made on the line side reaches frame subscribers
//! without touching the event loop from a foreign thread.

pub mod bridge;
pub mod frame;
pub mod line;
pub mod packet;

pub use bridge::{CallbackPublisher, ExternalPublisher, LoopHandle};
pub use frame::{FrameBridge, FrameHub, FrameServer};
pub use line::{LineBuffer, LineServer};
pub use packet::Packet;

#[cfg(test)]
mod wire_tests;
