//! Core Envelope Types
//!
//! Agent identifiers and the closed taxonomies carried by every envelope:
//! structural message type, semantic intent and urgency.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new unique agent ID of the form `agent-<8 hex>`
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("agent-{}", &uuid[..8]))
    }

    /// Create from string (for deserialization/testing)
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// System agent ID for framework operations
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Structural type of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Event,
    Request,
    Response,
    Notification,

    // Bidirectional coordination
    Feedback,
    AssistanceRequest,
    AssistanceResponse,
    NeedExpression,
    NeedFulfillment,
    Teaching,
    Learning,
}

impl MessageType {
    /// Wire name of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
            Self::Feedback => "feedback",
            Self::AssistanceRequest => "assistance_request",
            Self::AssistanceResponse => "assistance_response",
            Self::NeedExpression => "need_expression",
            Self::NeedFulfillment => "need_fulfillment",
            Self::Teaching => "teaching",
            Self::Learning => "learning",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic refinement of an envelope's purpose, orthogonal to its type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageIntent {
    // General
    Inform,
    Request,
    Respond,
    Notify,

    // Feedback
    ProvideFeedback,
    RequestFeedback,

    // Assistance
    RequestAssistance,
    OfferAssistance,

    // Needs
    ExpressNeed,
    FulfillNeed,

    // Teaching
    Teach,
    Learn,
    Clarify,
    Assess,

    // Specialized teaching
    KnowledgeGap,
    ContentRequest,
    ContentDelivery,
    ContentReview,
    ContentFeedback,
    ClarificationRequest,
    ClarificationResponse,
    StudentProgress,
    CurriculumUpdate,
    LearningAssessment,
    LearningFeedback,
}

impl MessageIntent {
    /// Intents handled by the teaching handler set
    pub const TEACHING: [MessageIntent; 10] = [
        Self::KnowledgeGap,
        Self::ContentRequest,
        Self::ContentReview,
        Self::ContentFeedback,
        Self::ClarificationRequest,
        Self::ClarificationResponse,
        Self::StudentProgress,
        Self::CurriculumUpdate,
        Self::LearningAssessment,
        Self::LearningFeedback,
    ];

    /// Whether this intent belongs to the teaching family
    pub fn is_teaching(&self) -> bool {
        Self::TEACHING.contains(self) || *self == Self::ContentDelivery
    }
}

impl fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Serialized form is the canonical wire name
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Urgency level of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}
