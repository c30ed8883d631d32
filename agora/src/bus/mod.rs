//! Message bus collaborator contract
//!
//! Agents talk to the broker through [`MessageBus`]. Every agent holds its own
//! client so read cursors are never shared; [`BusFactory`] hands those out.

pub mod memory;
pub mod topics;

pub use memory::{MemoryBroker, MemoryBus};
pub use topics::*;

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::WireMessage;

/// Bus errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to deliver to topic {topic}: {reason}")]
    DeliveryFailure { topic: String, reason: String },

    #[error("Failed to poll topic {topic}: {reason}")]
    PollFailure { topic: String, reason: String },

    #[error("Bus client is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Publish/subscribe transport with per-client read cursors
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Pin this client's cursor for `topic` at the current tail.
    ///
    /// Messages published before the call are not returned by [`read`](Self::read).
    async fn subscribe(&self, _topic: &str) -> Result<()> {
        Ok(())
    }

    /// Append a message to `topic`, returning the broker-assigned id
    async fn publish(&self, topic: &str, message: WireMessage) -> Result<String>;

    /// Non-blocking read of everything after this client's cursor on `topic`
    async fn read(&self, topic: &str) -> Result<Vec<WireMessage>>;
}

/// Source of independent bus clients
pub trait BusFactory: Send + Sync {
    fn client(&self) -> Arc<dyn MessageBus>;
}
