//! Performance analysis on top of feedback summaries

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::manager::{average_scores, window_start};
use super::{FeedbackManager, FeedbackRecord, Result};
use crate::envelope::AgentId;

/// Direction of an agent's scores across the analysis window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub agent_id: AgentId,
    pub days: i64,
    pub feedback_count: usize,
    pub performance_scores: BTreeMap<String, f64>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub improvement_suggestions: Vec<String>,
    pub trend: Trend,
}

pub struct FeedbackAnalyzer {
    manager: Arc<FeedbackManager>,
}

impl FeedbackAnalyzer {
    pub fn new(manager: Arc<FeedbackManager>) -> Self {
        Self { manager }
    }

    pub async fn analyze_agent_performance(
        &self,
        agent_id: &AgentId,
        days: Option<i64>,
    ) -> Result<PerformanceAnalysis> {
        let config = self.manager.config();
        let days = days.unwrap_or(config.window_days);
        let summary = self.manager.get_feedback_summary(agent_id, None, Some(days)).await?;

        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        for (field, score) in &summary.average_scores {
            let normalized = self.manager.normalize(*score);
            if normalized >= config.strength_threshold {
                strengths.push(field.clone());
            } else if normalized <= config.weakness_threshold {
                weaknesses.push(field.clone());
            }
        }

        let records = self.manager.records_in_window(agent_id, None, days).await?;
        let trend = self.trend(&records, days);

        Ok(PerformanceAnalysis {
            agent_id: agent_id.clone(),
            days,
            feedback_count: summary.count,
            performance_scores: summary.average_scores,
            strengths,
            weaknesses,
            improvement_suggestions: summary.common_suggestions,
            trend,
        })
    }

    /// Average of `metric` per agent, 0.0 where the agent has no such score
    pub async fn compare_agents(
        &self,
        agent_ids: &[AgentId],
        metric: &str,
        days: Option<i64>,
    ) -> Result<BTreeMap<AgentId, f64>> {
        let mut results = BTreeMap::new();
        for agent_id in agent_ids {
            let summary = self.manager.get_feedback_summary(agent_id, None, days).await?;
            let score = summary.average_scores.get(metric).copied().unwrap_or(0.0);
            results.insert(agent_id.clone(), score);
        }
        Ok(results)
    }

    /// Compare the newer half of the window with the older half
    fn trend(&self, records: &[FeedbackRecord], days: i64) -> Trend {
        let now = Utc::now();
        let start = window_start(now, days);
        let midpoint = start + (now - start) / 2;
        let (older, newer): (Vec<FeedbackRecord>, Vec<FeedbackRecord>) = records
            .iter()
            .cloned()
            .partition(|record| record.created_at < midpoint);

        let (Some(before), Some(after)) = (self.overall(&older), self.overall(&newer)) else {
            return Trend::Stable;
        };

        let delta = after - before;
        let tolerance = self.manager.config().trend_tolerance;
        if delta > tolerance {
            Trend::Improving
        } else if delta < -tolerance {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }

    /// Mean of the normalized field averages
    fn overall(&self, records: &[FeedbackRecord]) -> Option<f64> {
        let scores = average_scores(records);
        if scores.is_empty() {
            return None;
        }
        let total: f64 = scores.values().map(|score| self.manager.normalize(*score)).sum();
        Some(total / scores.len() as f64)
    }
}
