//! Envelope & Intent Model
//!
//! Typed envelopes exchanged between agents, the closed taxonomies they carry
//! and the flat wire format used on the bus.

#[allow(clippy::module_inception)]
pub mod envelope;
pub mod types;
pub mod wire;

pub use envelope::{ERROR_NOTIFICATION_KEY, Envelope, Payload, payload_from};
pub use types::{AgentId, MessageIntent, MessageType, Urgency};
pub use wire::{WireMessage, decode, encode};

/// Envelope errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Failed to decode envelope: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;
