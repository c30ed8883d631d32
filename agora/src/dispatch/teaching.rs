//! Teaching interactions
//!
//! [`TeachingHandlers`] installs a default handler for every teaching intent
//! carried on `notification` or `teaching` envelopes; applications override
//! the ones they care about with a later set. Keys are exact so that a
//! `feedback` envelope tagged with a teaching intent still reaches the
//! type-level feedback handler.
//! [`TeachingPatterns`] builds the outbound side of the same conversations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{HandlerKey, HandlerSet, MessageHandler};
use crate::agent::{AgentContext, Result};
use crate::config::TeachingConfig;
use crate::envelope::{AgentId, Envelope, MessageIntent, MessageType, Payload, Urgency, payload_from};
use crate::requests::deadline_after;

/// Default handlers for the teaching intents
#[derive(Debug, Clone, Copy, Default)]
pub struct TeachingHandlers;

impl TeachingHandlers {
    pub fn new() -> Self {
        Self
    }
}

impl HandlerSet for TeachingHandlers {
    fn name(&self) -> &str {
        "teaching"
    }

    fn handlers(&self) -> HashMap<HandlerKey, Arc<dyn MessageHandler>> {
        let mut handlers: HashMap<HandlerKey, Arc<dyn MessageHandler>> = HashMap::new();
        for intent in MessageIntent::TEACHING {
            let handler: Arc<dyn MessageHandler> = Arc::new(UnhandledTeaching(intent));
            for message_type in [MessageType::Notification, MessageType::Teaching] {
                handlers.insert(HandlerKey::new(message_type, intent), handler.clone());
            }
        }
        handlers
    }
}

struct UnhandledTeaching(MessageIntent);

#[async_trait]
impl MessageHandler for UnhandledTeaching {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        warn!(
            "Agent {} did not handle {} message {} from {}",
            ctx.id(),
            self.0,
            envelope.id,
            envelope.sender
        );
        Ok(())
    }
}

/// Result of reviewing a piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentReview {
    /// 0..1
    pub quality_score: f64,
    #[serde(default)]
    pub improvement_suggestions: Vec<String>,

    /// Additional scores (accuracy, relevance, ...)
    #[serde(default)]
    pub scores: Payload,
}

/// Where a reviewed piece of content was routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Delivered to the requester; carries the delivery envelope id
    Delivered(String),

    /// Sent back to its author as feedback; carries the feedback envelope id
    RevisionRequested(String),
}

/// Outbound teaching messages of one agent
pub struct TeachingPatterns<'a> {
    ctx: &'a AgentContext,
    config: &'a TeachingConfig,
}

impl<'a> TeachingPatterns<'a> {
    pub fn new(ctx: &'a AgentContext, config: &'a TeachingConfig) -> Self {
        Self { ctx, config }
    }

    fn professor(&self) -> AgentId {
        AgentId::from(self.config.professor_agent.as_str())
    }

    fn to_professor(&self, intent: MessageIntent, payload: Value) -> Envelope {
        Envelope::direct(self.ctx.id().clone(), self.professor(), payload_from(payload)).with_intent(intent)
    }

    /// Ask the professor for content on a topic a user is missing
    pub async fn identify_knowledge_gap(&self, user_id: &str, topic: &str, context: Payload) -> Result<String> {
        let user_waiting = context
            .get("user_waiting")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let urgency = if user_waiting { Urgency::High } else { Urgency::Normal };

        let deadline = deadline_after(
            Utc::now(),
            Duration::from_secs(self.config.knowledge_gap_deadline_secs),
        );
        let envelope = self
            .to_professor(
                MessageIntent::KnowledgeGap,
                json!({
                    "user_id": user_id,
                    "topic": topic,
                    "context": context,
                    "gap_id": uuid::Uuid::new_v4().to_string(),
                }),
            )
            .with_urgency(urgency)
            .requiring_response_by(deadline);

        self.ctx.send(&envelope).await?;
        debug!("Agent {} reported knowledge gap on {} for {}", self.ctx.id(), topic, user_id);
        Ok(envelope.id)
    }

    /// Route reviewed content: deliver it when good enough, otherwise ask for a revision
    pub async fn review_content(
        &self,
        content: Payload,
        review: &ContentReview,
        original_request: &Envelope,
    ) -> Result<ReviewOutcome> {
        if review.quality_score >= self.config.review_threshold {
            let requester = original_request
                .reply_address()
                .cloned()
                .unwrap_or_else(|| original_request.sender.clone());

            let delivery = Envelope::direct(
                self.ctx.id().clone(),
                requester,
                payload_from(json!({
                    "content": content,
                    "review_results": review,
                    "gap_id": original_request.payload.get("gap_id").cloned().unwrap_or(Value::Null),
                })),
            )
            .with_intent(MessageIntent::ContentDelivery)
            .with_correlation(original_request.id.clone());

            self.ctx.send(&delivery).await?;
            return Ok(ReviewOutcome::Delivered(delivery.id));
        }

        // The author is whoever the original request was addressed to
        let author = original_request
            .recipient
            .clone()
            .unwrap_or_else(|| original_request.sender.clone());
        let feedback = Envelope::feedback(
            self.ctx.id().clone(),
            author,
            original_request.id.clone(),
            payload_from(json!({
                "quality_score": review.quality_score,
                "improvement_suggestions": review.improvement_suggestions,
                "requires_revision": true,
            })),
        );

        self.ctx.send(&feedback).await?;
        Ok(ReviewOutcome::RevisionRequested(feedback.id))
    }

    pub async fn report_student_progress(
        &self,
        user_id: &str,
        topic: &str,
        mastery_level: f64,
        learning_style: &str,
        pain_points: &[String],
    ) -> Result<String> {
        let envelope = self
            .to_professor(
                MessageIntent::StudentProgress,
                json!({
                    "user_id": user_id,
                    "topic": topic,
                    "mastery_level": mastery_level.clamp(0.0, 1.0),
                    "learning_style": learning_style,
                    "pain_points": pain_points,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            );

        self.ctx.send(&envelope).await?;
        Ok(envelope.id)
    }

    /// High-urgency question expecting an answer within the clarification deadline
    pub async fn request_clarification(&self, user_id: &str, topic: &str, question: &str) -> Result<String> {
        let deadline = deadline_after(
            Utc::now(),
            Duration::from_secs(self.config.clarification_deadline_secs),
        );
        let envelope = self
            .to_professor(
                MessageIntent::ClarificationRequest,
                json!({
                    "user_id": user_id,
                    "topic": topic,
                    "question": question,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            )
            .with_urgency(Urgency::High)
            .requiring_response_by(deadline);

        self.ctx.send(&envelope).await?;
        Ok(envelope.id)
    }

    pub async fn assess_learning(&self, user_id: &str, topic: &str, assessment_data: Payload) -> Result<String> {
        let envelope = self
            .to_professor(
                MessageIntent::LearningAssessment,
                json!({
                    "user_id": user_id,
                    "topic": topic,
                    "assessment_data": assessment_data,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            );

        self.ctx.send(&envelope).await?;
        Ok(envelope.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dispatch::{DispatchTable, StandardHandlers};

    #[test]
    fn test_one_handler_per_teaching_intent() {
        let handlers = TeachingHandlers::new().handlers();
        assert_eq!(handlers.len(), 2 * MessageIntent::TEACHING.len());
        assert!(handlers.contains_key(&HandlerKey::new(MessageType::Notification, MessageIntent::KnowledgeGap)));
        assert!(handlers.contains_key(&HandlerKey::new(MessageType::Teaching, MessageIntent::LearningFeedback)));
        assert!(!handlers.contains_key(&HandlerKey::of_intent(MessageIntent::KnowledgeGap)));
        assert!(!handlers.contains_key(&HandlerKey::new(
            MessageType::Notification,
            MessageIntent::ContentDelivery
        )));
    }

    #[test]
    fn test_feedback_with_teaching_intent_reaches_feedback_handler() {
        let sets: Vec<Box<dyn HandlerSet>> = vec![Box::new(StandardHandlers::new()), Box::new(TeachingHandlers::new())];
        let table = DispatchTable::compose(&sets);
        let store_feedback = &table.handlers[&HandlerKey::of_type(MessageType::Feedback)].handler;

        for intent in [MessageIntent::ContentFeedback, MessageIntent::LearningFeedback] {
            let feedback = Envelope::feedback("critic", "tutor", "lesson-1", Payload::new()).with_intent(intent);
            let found = table.lookup(&feedback).unwrap();
            assert!(Arc::ptr_eq(found, store_feedback));
        }

        let gap = Envelope::direct("tutor", "professor", Payload::new()).with_intent(MessageIntent::KnowledgeGap);
        let found = table.lookup(&gap).unwrap();
        assert!(!Arc::ptr_eq(found, store_feedback));
        assert_eq!(
            table.owner(&HandlerKey::new(MessageType::Notification, MessageIntent::KnowledgeGap)),
            Some("teaching")
        );
    }

    #[test]
    fn test_review_deserializes_with_defaults() {
        let review: ContentReview = serde_json::from_value(json!({ "quality_score": 0.8 })).unwrap();
        assert!(review.improvement_suggestions.is_empty());
        assert!(review.scores.is_empty());
    }
}
