//! Topic naming convention

use crate::envelope::AgentId;

/// Topic every agent subscribes to for broadcasts
pub const BROADCAST_TOPIC: &str = "agent.broadcast";

pub const AGENT_STARTED: &str = "agent.started";
pub const AGENT_STOPPING: &str = "agent.stopping";
pub const AGENT_STOPPED: &str = "agent.stopped";

/// Unicast topic of an agent
pub fn agent_topic(id: &AgentId) -> String {
    format!("agent.{}", id)
}

/// Topic an event named `name` is published on
pub fn event_topic(name: &str) -> String {
    format!("event.{}", name)
}
