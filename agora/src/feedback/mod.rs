//! Feedback Aggregation
//!
//! Feedback records are appended through a [`FeedbackRepository`] and
//! summarized per recipient: numeric fields are averaged, suggestions ranked
//! by frequency, and low-scoring fields reported as improvement areas.

pub mod analyzer;
pub mod manager;
pub mod repository;

pub use analyzer::{FeedbackAnalyzer, PerformanceAnalysis, Trend};
pub use manager::{FeedbackManager, FeedbackSummary};
pub use repository::{FeedbackRepository, InMemoryFeedbackRepository};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{AgentId, Payload};

/// Feedback type used when none is given
pub const GENERAL_FEEDBACK: &str = "general";

/// Feedback errors
#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("Feedback repository error: {0}")]
    Repository(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FeedbackError>;

/// A stored piece of feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// Assigned by the repository
    pub id: u64,
    pub sender: AgentId,
    pub recipient: AgentId,
    pub content_id: Option<String>,
    pub message_id: Option<String>,
    pub feedback_type: String,
    pub data: Payload,
    pub created_at: DateTime<Utc>,
}

impl FeedbackRecord {
    /// Unsaved general feedback created now
    pub fn new(sender: impl Into<AgentId>, recipient: impl Into<AgentId>, data: Payload) -> Self {
        Self {
            id: 0,
            sender: sender.into(),
            recipient: recipient.into(),
            content_id: None,
            message_id: None,
            feedback_type: GENERAL_FEEDBACK.to_string(),
            data,
            created_at: Utc::now(),
        }
    }
}
