//! Flat string-map wire format
//!
//! Stream brokers carry flat `field -> string` maps. Nested values become JSON
//! strings, scalars are stringified and absent optionals are omitted.
//! Decoding tries JSON on every value and falls back to the raw string, except
//! for fields declared as strings which always keep the raw value.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::{Envelope, EnvelopeError};

/// A message as carried by the bus
pub type WireMessage = BTreeMap<String, String>;

/// Envelope fields that are strings on the wire and never JSON-decoded
const STRING_FIELDS: &[&str] = &[
    "id",
    "type",
    "sender",
    "recipient",
    "timestamp",
    "correlation_id",
    "reply_to",
    "intent",
    "urgency",
    "response_by",
];

/// Flatten an envelope into a wire message
pub fn encode(envelope: &Envelope) -> Result<WireMessage, EnvelopeError> {
    let value = serde_json::to_value(envelope).map_err(|e| EnvelopeError::Decode(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(EnvelopeError::Decode("envelope did not serialize to an object".to_string()));
    };

    let mut wire = WireMessage::new();
    for (key, value) in fields {
        match value {
            Value::Null => {}
            Value::String(s) => {
                wire.insert(key, s);
            }
            other => {
                wire.insert(key, other.to_string());
            }
        }
    }
    Ok(wire)
}

/// Rebuild an envelope from a wire message
pub fn decode(wire: &WireMessage) -> Result<Envelope, EnvelopeError> {
    let mut fields = Map::new();
    for (key, raw) in wire {
        let value = if STRING_FIELDS.contains(&key.as_str()) {
            Value::String(raw.clone())
        } else {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        };
        fields.insert(key.clone(), value);
    }

    serde_json::from_value(Value::Object(fields)).map_err(|e| EnvelopeError::Decode(e.to_string()))
}
