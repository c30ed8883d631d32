//! Outbound side of an agent: validate, encode, route, publish

use std::sync::Arc;

use tracing::debug;

use super::Result;
use crate::bus::{BROADCAST_TOPIC, MessageBus, agent_topic, event_topic};
use crate::envelope::{self, AgentId, Envelope, Payload};

/// Publishing handle bound to one agent and its bus client
#[derive(Clone)]
pub struct Outbox {
    agent_id: AgentId,
    bus: Arc<dyn MessageBus>,
}

impl Outbox {
    pub fn new(agent_id: AgentId, bus: Arc<dyn MessageBus>) -> Self {
        Self { agent_id, bus }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Route to `agent.<recipient>`, or the broadcast topic when there is none
    pub async fn send(&self, envelope: &Envelope) -> Result<String> {
        let topic = match &envelope.recipient {
            Some(recipient) => agent_topic(recipient),
            None => BROADCAST_TOPIC.to_string(),
        };
        self.publish(&topic, envelope).await
    }

    /// Publish to an explicit topic
    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<String> {
        envelope.validate()?;
        let wire = envelope::encode(envelope)?;
        let id = self.bus.publish(topic, wire).await?;
        debug!(
            "Agent {} published {} ({}) to {}",
            self.agent_id, envelope.id, envelope.message_type, topic
        );
        Ok(id)
    }

    /// Publish an Event envelope on `event.<name>`
    pub async fn publish_event(&self, name: &str, data: Payload) -> Result<String> {
        let event = Envelope::event(self.agent_id.clone(), name, data);
        self.publish(&event_topic(name), &event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentError;
    use crate::bus::MemoryBroker;
    use crate::envelope::{MessageType, decode};

    async fn outbox(broker: &MemoryBroker, id: &str) -> Outbox {
        let bus = broker.bus();
        bus.connect().await.unwrap();
        Outbox::new(AgentId::from(id), Arc::new(bus))
    }

    #[tokio::test]
    async fn test_send_routes_by_recipient() {
        let broker = MemoryBroker::new();
        let outbox = outbox(&broker, "a").await;

        outbox.send(&Envelope::direct("a", "b", Payload::new())).await.unwrap();
        outbox.send(&Envelope::broadcast("a", Payload::new())).await.unwrap();

        assert_eq!(broker.topic_len("agent.b").await, 1);
        assert_eq!(broker.topic_len(BROADCAST_TOPIC).await, 1);
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_not_published() {
        let broker = MemoryBroker::new();
        let outbox = outbox(&broker, "a").await;

        let mut response = Envelope::assistance_response("a", "b", "req", Payload::new());
        response.correlation_id = None;

        let err = outbox.send(&response).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidEnvelope(_)));
        assert_eq!(broker.topic_len("agent.b").await, 0);
    }

    #[tokio::test]
    async fn test_publish_event() {
        let broker = MemoryBroker::new();
        let outbox = outbox(&broker, "a").await;
        let reader = broker.bus();
        reader.connect().await.unwrap();

        outbox.publish_event("agent.started", Payload::new()).await.unwrap();

        let messages = reader.read("event.agent.started").await.unwrap();
        assert_eq!(messages.len(), 1);
        let event = decode(&messages[0]).unwrap();
        assert_eq!(event.message_type, MessageType::Event);
        assert_eq!(event.payload_str("event_type"), Some("agent.started"));
    }

    #[tokio::test]
    async fn test_delivery_failure_surfaces() {
        let broker = MemoryBroker::new();
        let outbox = outbox(&broker, "a").await;
        broker.set_available(false);

        let err = outbox
            .send(&Envelope::direct("a", "b", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Bus(crate::bus::BusError::DeliveryFailure { .. })));
    }
}
