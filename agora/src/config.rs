//! Configuration for the Agora runtime
//!
//! One [`AgoraConfig`] is built at startup and handed to every component.
//! It is stored as TOML; every section has defaults so a partial file works.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::envelope::Payload;

/// Default configuration file looked up by [`AgoraConfig::load`]
pub const DEFAULT_CONFIG_FILE: &str = "agora.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgoraConfig {
    pub runtime: RuntimeConfig,
    pub feedback: FeedbackConfig,
    pub teaching: TeachingConfig,

    /// Agents started by `agora run`
    pub agents: Vec<AgentSpec>,
}

/// Agent loop timing and protocol defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Sleep between poll cycles
    pub poll_interval_ms: u64,

    /// Sleep after a failed poll
    pub error_backoff_ms: u64,

    /// Assistance request timeout when none is given
    pub request_timeout_secs: u64,

    /// Need expression timeout when none is given
    pub need_timeout_secs: u64,

    /// Inbound queue depth that triggers a warning
    pub queue_warn_threshold: usize,

    /// Per-topic retention of the in-process broker (None keeps everything)
    pub broker_retention: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            error_backoff_ms: 1000,
            request_timeout_secs: 60,
            need_timeout_secs: 300,
            queue_warn_threshold: 1000,
            broker_retention: Some(10_000),
        }
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn need_timeout(&self) -> Duration {
        Duration::from_secs(self.need_timeout_secs)
    }
}

/// Feedback summarization thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Raw scores are divided by this before threshold comparison
    pub score_scale: f64,

    /// Normalized average below which a field is an improvement area
    pub improvement_threshold: f64,

    /// Normalized average at or above which a field is a strength
    pub strength_threshold: f64,

    /// Normalized average at or below which a field is a weakness
    pub weakness_threshold: f64,

    pub window_days: i64,

    /// Minimum normalized change between window halves to report a trend
    pub trend_tolerance: f64,

    pub top_suggestions: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            score_scale: 10.0,
            improvement_threshold: 0.7,
            strength_threshold: 0.8,
            weakness_threshold: 0.6,
            window_days: 30,
            trend_tolerance: 0.05,
            top_suggestions: 5,
        }
    }
}

/// Teaching interaction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeachingConfig {
    /// Agent that receives knowledge gaps and progress reports
    pub professor_agent: String,

    /// Reviews scoring at least this are delivered, others sent back for revision
    pub review_threshold: f64,

    pub clarification_deadline_secs: u64,

    pub knowledge_gap_deadline_secs: u64,
}

impl Default for TeachingConfig {
    fn default() -> Self {
        Self {
            professor_agent: String::from("professor"),
            review_threshold: 0.7,
            clarification_deadline_secs: 120,
            knowledge_gap_deadline_secs: 300,
        }
    }
}

/// Declarative description of an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    /// Generated when absent
    pub id: Option<String>,

    pub name: String,

    pub capabilities: Vec<String>,

    /// Install the teaching handler set
    pub teaching: bool,

    /// Static data offered to every matching need
    pub need_fulfillment: Option<Payload>,
}

impl AgoraConfig {
    /// Load `./agora.toml` when present, otherwise defaults
    pub fn load() -> Result<Self> {
        let path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if path.exists() {
            return Self::load_from_path(&path);
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = self.to_toml()?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
