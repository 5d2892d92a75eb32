//! The broker: subscription index, connection registry, publish fan-out and
//! the diagnostic event stream.

pub mod engine;
pub mod events;
pub mod message;
pub mod registry;
pub mod topic;

pub use engine::Broker;
pub use events::{BrokerEvent, EventSink};
pub use message::{Message, ServerMessage};
pub use topic::{SubscriptionIndex, WildcardMode};
