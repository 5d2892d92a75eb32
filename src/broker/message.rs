//! Message definitions for the broker
//!
//! `Message` is what a publish carries internally: topic, arbitrary JSON
//! data, and the connection it came from (used only for echo suppression).
//! `ServerMessage` is what subscribers see on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::ConnectionId;

pub const STATUS_SUBSCRIBED: &str = "subscribed";

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub data: Value,
    pub origin: Option<ConnectionId>,
}

impl Message {
    pub fn new(topic: impl Into<String>, data: Value, origin: Option<ConnectionId>) -> Self {
        Self {
            topic: topic.into(),
            data,
            origin,
        }
    }

    pub fn envelope(&self) -> ServerMessage {
        ServerMessage::Message {
            topic: self.topic.clone(),
            data: self.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Subscribed { topic: String, status: String },
    Message { topic: String, data: Value },
}

impl ServerMessage {
    pub fn subscribed(topic: &str) -> Self {
        ServerMessage::Subscribed {
            topic: topic.to_string(),
            status: STATUS_SUBSCRIBED.to_string(),
        }
    }

    /// One JSON document, no delimiter. Used as-is for frames.
    pub fn to_json(&self) -> String {
        // a map of strings and a serde_json::Value cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    /// One JSON document followed by `\n`.
    pub fn to_line(&self) -> String {
        let mut line = self.to_json();
        line.push('\n');
        line
    }
}
