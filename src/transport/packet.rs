use serde::Deserialize;
use serde_json::Value;

use crate::utils::PacketError;

/// A decoded client packet.
///
/// `action` is matched case-insensitively. Anything other than SUB, UNSUB or
/// PUB becomes `Unrecognized` so newer clients do not break older brokers.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, data: Value },
    Unrecognized { action: String },
}

/// Wire shape. Every field is optional; a missing topic is the empty topic
/// and a missing `data` is `null`.
#[derive(Debug, Deserialize)]
struct RawPacket {
    #[serde(default)]
    action: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    data: Value,
}

impl Packet {
    /// Decode an already-parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self, PacketError> {
        if !value.is_object() {
            return Err(PacketError::NotAnObject);
        }
        let raw: RawPacket = serde_json::from_value(value)?;
        let action = raw.action.to_uppercase();
        Ok(match action.as_str() {
            "SUB" => Packet::Subscribe { topic: raw.topic },
            "UNSUB" => Packet::Unsubscribe { topic: raw.topic },
            "PUB" => Packet::Publish {
                topic: raw.topic,
                data: raw.data,
            },
            _ => Packet::Unrecognized { action },
        })
    }
}

/// Parse one frame or line. The raw JSON is returned alongside the packet so
/// it can be reported as-is.
pub fn parse(text: &str) -> Result<(Value, Packet), PacketError> {
    let value: Value = serde_json::from_str(text)?;
    let packet = Packet::from_value(value.clone())?;
    Ok((value, packet))
}
