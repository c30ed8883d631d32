//! Feedback recording and summarization

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{FeedbackRecord, FeedbackRepository, GENERAL_FEEDBACK, Result};
use crate::config::FeedbackConfig;
use crate::envelope::{AgentId, Payload};

/// Aggregate view of a recipient's feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub recipient: AgentId,
    pub feedback_type: Option<String>,
    pub days: i64,
    pub count: usize,

    /// Raw-scale averages of every numeric field
    pub average_scores: BTreeMap<String, f64>,

    /// Most frequent suggestions, ties in first-seen order
    pub common_suggestions: Vec<String>,

    /// Fields whose normalized average is below the improvement threshold
    pub improvement_areas: Vec<String>,
}

pub struct FeedbackManager {
    repository: Arc<dyn FeedbackRepository>,
    config: FeedbackConfig,
}

impl FeedbackManager {
    pub fn new(repository: Arc<dyn FeedbackRepository>, config: FeedbackConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    /// Scale a raw score into 0..1 terms
    pub fn normalize(&self, score: f64) -> f64 {
        if self.config.score_scale > 0.0 {
            score / self.config.score_scale
        } else {
            score
        }
    }

    pub async fn record_feedback(
        &self,
        sender: &AgentId,
        recipient: &AgentId,
        data: Payload,
        content_id: Option<&str>,
        message_id: Option<&str>,
        feedback_type: Option<&str>,
    ) -> Result<FeedbackRecord> {
        let mut record = FeedbackRecord::new(sender.clone(), recipient.clone(), data);
        record.content_id = content_id.map(str::to_string);
        record.message_id = message_id.map(str::to_string);
        record.feedback_type = feedback_type.unwrap_or(GENERAL_FEEDBACK).to_string();

        let record = self.repository.add(record).await?;
        debug!(
            "Recorded {} feedback {} from {} for {}",
            record.feedback_type, record.id, sender, recipient
        );
        Ok(record)
    }

    /// Records for `recipient` created within the last `days`
    pub async fn records_in_window(
        &self,
        recipient: &AgentId,
        feedback_type: Option<&str>,
        days: i64,
    ) -> Result<Vec<FeedbackRecord>> {
        let since = window_start(Utc::now(), days);
        self.repository.query(recipient, feedback_type, Some(since)).await
    }

    /// Summarize feedback for `recipient`; `days` defaults to the configured window
    pub async fn get_feedback_summary(
        &self,
        recipient: &AgentId,
        feedback_type: Option<&str>,
        days: Option<i64>,
    ) -> Result<FeedbackSummary> {
        let days = days.unwrap_or(self.config.window_days);
        let records = self.records_in_window(recipient, feedback_type, days).await?;

        let average_scores = average_scores(&records);
        let improvement_areas = average_scores
            .iter()
            .filter(|(_, avg)| self.normalize(**avg) < self.config.improvement_threshold)
            .map(|(field, _)| field.clone())
            .collect();

        Ok(FeedbackSummary {
            recipient: recipient.clone(),
            feedback_type: feedback_type.map(str::to_string),
            days,
            count: records.len(),
            common_suggestions: common_suggestions(&records, self.config.top_suggestions),
            average_scores,
            improvement_areas,
        })
    }

    /// Newest first, at most `limit`
    pub async fn feedback_for_recipient(
        &self,
        recipient: &AgentId,
        feedback_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FeedbackRecord>> {
        let records = self.repository.query(recipient, feedback_type, None).await?;
        Ok(newest_first(records, limit))
    }

    pub async fn feedback_for_content(&self, content_id: &str, limit: usize) -> Result<Vec<FeedbackRecord>> {
        let records = self.repository.query_by_content(content_id).await?;
        Ok(newest_first(records, limit))
    }

    pub async fn feedback_for_message(&self, message_id: &str, limit: usize) -> Result<Vec<FeedbackRecord>> {
        let records = self.repository.query_by_message(message_id).await?;
        Ok(newest_first(records, limit))
    }
}

pub(crate) fn window_start(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    chrono::Duration::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Mean of every numeric field; booleans and `timestamp` are not scores
pub(crate) fn average_scores(records: &[FeedbackRecord]) -> BTreeMap<String, f64> {
    let mut totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for record in records {
        for (key, value) in &record.data {
            if key == "timestamp" {
                continue;
            }
            if let Some(score) = value.as_f64() {
                let entry = totals.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += score;
                entry.1 += 1;
            }
        }
    }

    totals
        .into_iter()
        .map(|(key, (sum, count))| (key, sum / count as f64))
        .collect()
}

fn common_suggestions(records: &[FeedbackRecord], top: usize) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut first_seen: Vec<&str> = Vec::new();

    for record in records {
        let Some(Value::Array(suggestions)) = record.data.get("suggestions") else {
            continue;
        };
        for suggestion in suggestions.iter().filter_map(Value::as_str) {
            let count = counts.entry(suggestion).or_insert(0);
            if *count == 0 {
                first_seen.push(suggestion);
            }
            *count += 1;
        }
    }

    // Stable sort keeps first-seen order among ties
    first_seen.sort_by(|a, b| counts[b].cmp(&counts[a]));
    first_seen.into_iter().take(top).map(str::to_string).collect()
}

fn newest_first(mut records: Vec<FeedbackRecord>, limit: usize) -> Vec<FeedbackRecord> {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    records.truncate(limit);
    records
}
