//! The message envelope exchanged between agents
//!
//! Every unit of communication on the bus is an [`Envelope`]. Construction
//! helpers produce well-formed envelopes for each intent family; chainable
//! `with_*` modifiers adjust the optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{AgentId, EnvelopeError, MessageIntent, MessageType, Urgency};

/// Opaque key-value map used for payloads and metadata
pub type Payload = Map<String, Value>;

/// Metadata key marking error notifications produced by the dispatch boundary
pub const ERROR_NOTIFICATION_KEY: &str = "error_notification";

/// Unified message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID
    pub id: String,

    /// Structural type
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Source agent
    pub sender: AgentId,

    /// Target agent (None for broadcast)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<AgentId>,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    /// Message payload
    #[serde(default)]
    pub payload: Payload,

    /// ID of the envelope this one answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Return address overriding `sender` for replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<AgentId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<MessageIntent>,

    #[serde(default)]
    pub urgency: Urgency,

    #[serde(default)]
    pub requires_response: bool,

    /// Deadline for a response, if one is expected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_by: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: Payload,
}

impl Envelope {
    /// Create a bare envelope with a fresh id and the current timestamp
    pub fn new(message_type: MessageType, sender: impl Into<AgentId>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type,
            sender: sender.into(),
            recipient: None,
            timestamp: Utc::now(),
            payload: Payload::new(),
            correlation_id: None,
            reply_to: None,
            intent: None,
            urgency: Urgency::Normal,
            requires_response: false,
            response_by: None,
            metadata: Payload::new(),
        }
    }

    // ==========================================================================
    // Intent families
    // ==========================================================================

    /// Direct message to a specific recipient
    pub fn direct(
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        payload: Payload,
    ) -> Self {
        Self::new(MessageType::Notification, sender)
            .to(recipient)
            .with_payload(payload)
            .with_intent(MessageIntent::Inform)
    }

    /// Broadcast message to all agents
    pub fn broadcast(sender: impl Into<AgentId>, payload: Payload) -> Self {
        Self::new(MessageType::Notification, sender)
            .with_payload(payload)
            .with_intent(MessageIntent::Inform)
    }

    /// Feedback about a previous message or piece of content
    pub fn feedback(
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        about_message_id: impl Into<String>,
        feedback_data: Payload,
    ) -> Self {
        let about_message_id = about_message_id.into();
        Self::new(MessageType::Feedback, sender)
            .to(recipient)
            .with_intent(MessageIntent::ProvideFeedback)
            .with_payload(payload_from(json!({
                "about_message_id": about_message_id,
                "feedback_data": feedback_data,
            })))
            .with_correlation(about_message_id)
    }

    /// Point-to-point request for assistance; always expects a response
    pub fn assistance_request(
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        request_type: impl Into<String>,
        context: Payload,
    ) -> Self {
        let mut envelope = Self::new(MessageType::AssistanceRequest, sender)
            .to(recipient)
            .with_intent(MessageIntent::RequestAssistance)
            .with_payload(payload_from(json!({
                "request_type": request_type.into(),
                "context": context,
            })));
        envelope.requires_response = true;
        envelope
    }

    /// Response to an assistance request
    pub fn assistance_response(
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        request_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::new(MessageType::AssistanceResponse, sender)
            .to(recipient)
            .with_intent(MessageIntent::Respond)
            .with_payload(payload)
            .with_correlation(request_id)
    }

    /// Broadcast expression of a need
    pub fn need_expression(
        sender: impl Into<AgentId>,
        need_type: impl Into<String>,
        description: impl Into<String>,
        required_capabilities: &[String],
    ) -> Self {
        Self::new(MessageType::NeedExpression, sender)
            .with_intent(MessageIntent::ExpressNeed)
            .with_payload(payload_from(json!({
                "need_type": need_type.into(),
                "description": description.into(),
                "required_capabilities": required_capabilities,
            })))
    }

    /// Fulfillment of a need expressed by `recipient`
    pub fn need_fulfillment(
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        need_id: impl Into<String>,
        fulfillment_data: Payload,
    ) -> Self {
        let need_id = need_id.into();
        Self::new(MessageType::NeedFulfillment, sender)
            .to(recipient)
            .with_intent(MessageIntent::FulfillNeed)
            .with_payload(payload_from(json!({
                "need_id": need_id,
                "fulfillment_data": fulfillment_data,
            })))
            .with_correlation(need_id)
    }

    /// Lifecycle or domain event; `event_type` is folded into the payload
    pub fn event(sender: impl Into<AgentId>, event_type: &str, data: Payload) -> Self {
        let mut payload = Payload::new();
        payload.insert("event_type".to_string(), Value::String(event_type.to_string()));
        payload.extend(data);
        Self::new(MessageType::Event, sender).with_payload(payload)
    }

    /// Error notification answering `original`
    pub fn error_notification(
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        original_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::new(MessageType::Notification, sender)
            .to(recipient)
            .with_intent(MessageIntent::Notify)
            .with_payload(payload_from(json!({ "error": error.into() })))
            .with_correlation(original_id);
        envelope
            .metadata
            .insert(ERROR_NOTIFICATION_KEY.to_string(), Value::Bool(true));
        envelope
    }

    // ==========================================================================
    // Modifiers
    // ==========================================================================

    pub fn to(mut self, recipient: impl Into<AgentId>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_intent(mut self, intent: MessageIntent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<AgentId>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Mark the envelope as expecting a response before `deadline`
    pub fn requiring_response_by(mut self, deadline: DateTime<Utc>) -> Self {
        self.requires_response = true;
        self.response_by = Some(deadline);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    // ==========================================================================
    // Accessors
    // ==========================================================================

    /// Address replies should go to: `reply_to`, else `sender`
    pub fn reply_address(&self) -> Option<&AgentId> {
        self.reply_to
            .as_ref()
            .filter(|id| !id.is_empty())
            .or_else(|| Some(&self.sender).filter(|id| !id.is_empty()))
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    pub fn is_error_notification(&self) -> bool {
        self.metadata
            .get(ERROR_NOTIFICATION_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// String field from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Object field from the payload, empty when absent or not an object
    pub fn payload_object(&self, key: &str) -> Payload {
        self.payload
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// String array field from the payload; non-string items are skipped
    pub fn payload_strings(&self, key: &str) -> Vec<String> {
        self.payload
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ==========================================================================
    // Validation
    // ==========================================================================

    /// Check the fields each message type requires
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        if self.sender.is_empty() {
            return Err(EnvelopeError::MissingField("sender"));
        }

        match self.message_type {
            MessageType::Feedback => {
                self.require_recipient()?;
                self.require_payload("feedback_data")?;
            }
            MessageType::AssistanceRequest => {
                self.require_recipient()?;
                if self.payload_str("request_type").is_none() {
                    return Err(EnvelopeError::MissingField("payload.request_type"));
                }
            }
            MessageType::AssistanceResponse => {
                self.require_recipient()?;
                self.require_correlation()?;
            }
            MessageType::NeedExpression => {
                if self.payload_str("need_type").is_none() {
                    return Err(EnvelopeError::MissingField("payload.need_type"));
                }
                match self.payload.get("required_capabilities") {
                    Some(Value::Array(_)) => {}
                    Some(_) => {
                        return Err(EnvelopeError::InvalidField {
                            field: "payload.required_capabilities",
                            reason: "expected an array of capability names".to_string(),
                        });
                    }
                    None => {
                        return Err(EnvelopeError::MissingField("payload.required_capabilities"));
                    }
                }
            }
            MessageType::NeedFulfillment => {
                self.require_recipient()?;
                self.require_correlation()?;
            }
            _ => {}
        }

        Ok(())
    }

    fn require_recipient(&self) -> Result<(), EnvelopeError> {
        match &self.recipient {
            Some(recipient) if !recipient.is_empty() => Ok(()),
            _ => Err(EnvelopeError::MissingField("recipient")),
        }
    }

    fn require_correlation(&self) -> Result<(), EnvelopeError> {
        match &self.correlation_id {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err(EnvelopeError::MissingField("correlation_id")),
        }
    }

    fn require_payload(&self, key: &'static str) -> Result<(), EnvelopeError> {
        if self.payload.contains_key(key) {
            Ok(())
        } else {
            Err(EnvelopeError::MissingField(key))
        }
    }
}

/// Convert a `json!` object literal into a payload map
pub fn payload_from(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_message_defaults() {
        let envelope = Envelope::direct("tutor", "professor", Payload::new());

        assert_eq!(envelope.message_type, MessageType::Notification);
        assert_eq!(envelope.intent, Some(MessageIntent::Inform));
        assert_eq!(envelope.urgency, Urgency::Normal);
        assert!(!envelope.requires_response);
        assert_eq!(envelope.recipient, Some(AgentId::from("professor")));
        assert!(!envelope.id.is_empty());
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_unique_ids() {
        let a = Envelope::broadcast("a", Payload::new());
        let b = Envelope::broadcast("a", Payload::new());
        assert_ne!(a.id, b.id);
        assert!(a.is_broadcast());
    }

    #[test]
    fn test_assistance_request_requires_response() {
        let envelope = Envelope::assistance_request(
            "tutor",
            "professor",
            "content-creation",
            payload_from(json!({ "topic": "machine learning" })),
        );

        assert!(envelope.requires_response);
        assert_eq!(envelope.intent, Some(MessageIntent::RequestAssistance));
        assert_eq!(envelope.payload_str("request_type"), Some("content-creation"));
        assert_eq!(envelope.payload_object("context")["topic"], json!("machine learning"));
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_feedback_correlates_with_subject() {
        let envelope = Envelope::feedback(
            "reviewer",
            "professor",
            "msg-1",
            payload_from(json!({ "quality": 8 })),
        );

        assert_eq!(envelope.correlation_id.as_deref(), Some("msg-1"));
        assert_eq!(envelope.payload_str("about_message_id"), Some("msg-1"));
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_need_fulfillment_correlates_with_need() {
        let envelope = Envelope::need_fulfillment("curator", "professor", "need-1", Payload::new());
        assert_eq!(envelope.correlation_id.as_deref(), Some("need-1"));
        assert_eq!(envelope.payload_str("need_id"), Some("need-1"));
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut response = Envelope::assistance_response("b", "a", "req-1", Payload::new());
        response.correlation_id = None;
        assert!(matches!(
            response.validate(),
            Err(EnvelopeError::MissingField("correlation_id"))
        ));

        let mut need = Envelope::need_expression("a", "storage", "disk", &["storage".to_string()]);
        need.payload.insert("required_capabilities".to_string(), json!("storage"));
        assert!(matches!(need.validate(), Err(EnvelopeError::InvalidField { .. })));

        let mut request = Envelope::assistance_request("a", "b", "help", Payload::new());
        request.recipient = None;
        assert!(matches!(request.validate(), Err(EnvelopeError::MissingField("recipient"))));

        let anonymous = Envelope::new(MessageType::Command, "");
        assert!(matches!(anonymous.validate(), Err(EnvelopeError::MissingField("sender"))));
    }

    #[test]
    fn test_reply_address_prefers_reply_to() {
        let envelope = Envelope::direct("a", "b", Payload::new());
        assert_eq!(envelope.reply_address(), Some(&AgentId::from("a")));

        let envelope = envelope.with_reply_to("inbox");
        assert_eq!(envelope.reply_address(), Some(&AgentId::from("inbox")));
    }

    #[test]
    fn test_event_folds_type_into_payload() {
        let event = Envelope::event(
            "a",
            "agent.started",
            payload_from(json!({ "agent_id": "a" })),
        );
        assert_eq!(event.message_type, MessageType::Event);
        assert_eq!(event.payload_str("event_type"), Some("agent.started"));
        assert_eq!(event.payload_str("agent_id"), Some("a"));
    }

    #[test]
    fn test_error_notification_is_marked() {
        let envelope = Envelope::error_notification("b", "a", "msg-1", "boom");
        assert!(envelope.is_error_notification());
        assert_eq!(envelope.payload_str("error"), Some("boom"));
        assert_eq!(envelope.correlation_id.as_deref(), Some("msg-1"));
    }
}
