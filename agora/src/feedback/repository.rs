//! Feedback storage collaborator

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{FeedbackError, FeedbackRecord, Result};
use crate::envelope::AgentId;

/// Append-only feedback store
#[async_trait]
pub trait FeedbackRepository: Send + Sync {
    /// Store a record, returning it with its assigned id
    async fn add(&self, record: FeedbackRecord) -> Result<FeedbackRecord>;

    /// Records for `recipient`, optionally of one type and created at or after `since`
    async fn query(
        &self,
        recipient: &AgentId,
        feedback_type: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FeedbackRecord>>;

    async fn query_by_content(&self, content_id: &str) -> Result<Vec<FeedbackRecord>>;

    async fn query_by_message(&self, message_id: &str) -> Result<Vec<FeedbackRecord>>;
}

/// Repository kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryFeedbackRepository {
    records: RwLock<Vec<FeedbackRecord>>,
    next_id: AtomicU64,
}

impl InMemoryFeedbackRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn filtered(&self, predicate: impl Fn(&FeedbackRecord) -> bool) -> Vec<FeedbackRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| predicate(record))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FeedbackRepository for InMemoryFeedbackRepository {
    async fn add(&self, mut record: FeedbackRecord) -> Result<FeedbackRecord> {
        if record.sender.is_empty() || record.recipient.is_empty() {
            return Err(FeedbackError::Repository(
                "feedback needs both a sender and a recipient".to_string(),
            ));
        }
        record.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.records.write().await.push(record.clone());
        Ok(record)
    }

    async fn query(
        &self,
        recipient: &AgentId,
        feedback_type: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .filtered(|record| {
                record.recipient == *recipient
                    && feedback_type.is_none_or(|t| record.feedback_type == t)
                    && since.is_none_or(|since| record.created_at >= since)
            })
            .await)
    }

    async fn query_by_content(&self, content_id: &str) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .filtered(|record| record.content_id.as_deref() == Some(content_id))
            .await)
    }

    async fn query_by_message(&self, message_id: &str) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .filtered(|record| record.message_id.as_deref() == Some(message_id))
            .await)
    }
}
