//! Agent Core
//!
//! Long-lived actors that exchange envelopes over the bus. Each agent runs a
//! message loop and a topic poller as two tasks, plus any timeout tasks its
//! request and need bookkeeping schedules.

pub mod actor;
pub mod context;
pub mod outbox;
pub mod state;
pub mod timers;

pub use actor::{Agent, AgentBehavior, AgentBuilder, AgentInfo, NoopBehavior};
pub use context::{AgentContext, ReceivedFeedback};
pub use outbox::Outbox;
pub use state::{AgentState, MessageMetrics, MetricsSnapshot, StateCell};
pub use timers::TimerScope;

use crate::bus::BusError;
use crate::envelope::EnvelopeError;

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: AgentState, to: AgentState },

    #[error("Agent initialization failed: {0}")]
    InitializationFailed(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
