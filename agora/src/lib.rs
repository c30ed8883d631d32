//! Agora - Multi-Agent Envelope Runtime
//!
//! Long-lived agents exchange typed envelopes over a publish/subscribe bus.
//! Each agent polls its topics, dispatches envelopes to composable handler
//! sets and keeps its own request, need and feedback bookkeeping.
//!
//! # Architecture
//!
//! - `envelope` - Envelope model, intents and the flat wire format
//! - `bus` - Message bus contract and the in-process broker
//! - `agent` - Agent lifecycle, message loop and topic poller
//! - `dispatch` - Handler sets and the per-agent dispatch table
//! - `requests` - Assistance request/response tracking with timeouts
//! - `needs` - Broadcast needs and decentralized fulfillment
//! - `feedback` - Feedback storage, summaries and performance analysis
//! - `registry` - Capability directory built from lifecycle events
//! - `manager` - Agent factory and manager
//! - `config` - TOML configuration

pub mod agent;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod feedback;
pub mod manager;
pub mod needs;
pub mod registry;
pub mod requests;

pub use agent::{Agent, AgentBehavior, AgentBuilder, AgentContext, AgentError, AgentState};
pub use bus::{BusError, BusFactory, MemoryBroker, MessageBus};
pub use config::AgoraConfig;
pub use dispatch::{HandlerKey, HandlerMap, HandlerSet, MessageHandler};
pub use envelope::{AgentId, Envelope, MessageIntent, MessageType, Payload, Urgency};
pub use manager::{AgentFactory, AgentManager};
pub use registry::CapabilityRegistry;

/// Agora version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
