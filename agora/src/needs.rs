//! Needs Protocol
//!
//! Agents broadcast needs; every receiver decides for itself whether its
//! capabilities qualify and whether to answer. Any eligible agent may respond,
//! so a need can collect zero, one or many fulfillments.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::agent::{AgentContext, Outbox, Result, TimerScope};
use crate::envelope::{AgentId, Envelope, Payload, Urgency};
use crate::requests::deadline_after;

/// Well-known need categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedType {
    // Resources
    ComputeResources,
    StorageResources,
    MemoryResources,

    // Data
    DataSource,
    DataAccess,
    DataProcessing,

    // Knowledge
    KnowledgeBase,
    DomainExpertise,
    TrainingData,

    // Services
    ApiAccess,
    ExternalService,
    Authentication,

    // Coordination
    TaskDelegation,
    WorkflowCoordination,
    PriorityAdjustment,
}

impl NeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComputeResources => "compute_resources",
            Self::StorageResources => "storage_resources",
            Self::MemoryResources => "memory_resources",
            Self::DataSource => "data_source",
            Self::DataAccess => "data_access",
            Self::DataProcessing => "data_processing",
            Self::KnowledgeBase => "knowledge_base",
            Self::DomainExpertise => "domain_expertise",
            Self::TrainingData => "training_data",
            Self::ApiAccess => "api_access",
            Self::ExternalService => "external_service",
            Self::Authentication => "authentication",
            Self::TaskDelegation => "task_delegation",
            Self::WorkflowCoordination => "workflow_coordination",
            Self::PriorityAdjustment => "priority_adjustment",
        }
    }
}

impl fmt::Display for NeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<NeedType> for String {
    fn from(need_type: NeedType) -> Self {
        need_type.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedStatus {
    Pending,
    Fulfilled,
    Expired,
}

/// One provider's answer to a need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub provider: AgentId,
    pub data: Payload,
    pub received_at: DateTime<Utc>,
}

/// A need this agent broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressedNeed {
    pub need_id: String,
    pub need_type: String,
    pub description: String,
    pub required_capabilities: Vec<String>,
    pub context: Payload,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: NeedStatus,

    /// Append-only, in arrival order
    pub fulfillments: Vec<Fulfillment>,
}

/// A fulfillment this agent sent to someone else's need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidedFulfillment {
    pub need_id: String,
    pub requester: AgentId,
    pub data: Payload,
    pub created_at: DateTime<Utc>,
}

/// Parameters of a need about to be expressed
#[derive(Debug, Clone)]
pub struct NeedDraft {
    pub need_type: String,
    pub description: String,
    pub required_capabilities: Vec<String>,
    pub context: Payload,
    pub urgency: Urgency,

    /// Falls back to the configured need timeout
    pub timeout: Option<Duration>,
}

impl NeedDraft {
    pub fn new(need_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            need_type: need_type.into(),
            description: description.into(),
            required_capabilities: Vec::new(),
            context: Payload::new(),
            urgency: Urgency::Normal,
            timeout: None,
        }
    }

    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, context: Payload) -> Self {
        self.context = context;
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A need received from another agent, as seen by a potential provider
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingNeed {
    pub need_id: String,
    pub requester: AgentId,
    pub need_type: String,
    pub description: String,
    pub required_capabilities: Vec<String>,
    pub context: Payload,
    pub urgency: Urgency,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IncomingNeed {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            need_id: envelope.id.clone(),
            requester: envelope
                .reply_address()
                .cloned()
                .unwrap_or_else(|| envelope.sender.clone()),
            need_type: envelope.payload_str("need_type").unwrap_or_default().to_string(),
            description: envelope.payload_str("description").unwrap_or_default().to_string(),
            required_capabilities: envelope.payload_strings("required_capabilities"),
            context: envelope.payload_object("context"),
            urgency: envelope.urgency,
            expires_at: envelope
                .payload_str("expires_at")
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|at| at.with_timezone(&Utc)),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// An empty requirement list matches everyone; otherwise one shared capability suffices
pub fn matches_capabilities(required: &[String], capabilities: &BTreeSet<String>) -> bool {
    required.is_empty() || required.iter().any(|cap| capabilities.contains(cap))
}

/// Decides whether and how an eligible agent answers a need
#[async_trait]
pub trait NeedResponder: Send + Sync {
    /// Fulfillment data, or `None` to decline
    async fn respond(&self, ctx: &AgentContext, need: &IncomingNeed) -> anyhow::Result<Option<Payload>>;
}

/// Responds to every eligible need with the same data
pub struct StaticFulfillment {
    data: Payload,
}

impl StaticFulfillment {
    pub fn new(data: Payload) -> Self {
        Self { data }
    }
}

#[async_trait]
impl NeedResponder for StaticFulfillment {
    async fn respond(&self, _ctx: &AgentContext, _need: &IncomingNeed) -> anyhow::Result<Option<Payload>> {
        Ok(Some(self.data.clone()))
    }
}

/// Per-agent bookkeeping of expressed needs and provided fulfillments
#[derive(Clone)]
pub struct NeedsProtocol {
    outbox: Outbox,
    timers: TimerScope,
    default_timeout: Duration,
    expressed: Arc<RwLock<HashMap<String, ExpressedNeed>>>,
    provided: Arc<RwLock<Vec<ProvidedFulfillment>>>,
}

impl NeedsProtocol {
    pub fn new(outbox: Outbox, timers: TimerScope, default_timeout: Duration) -> Self {
        Self {
            outbox,
            timers,
            default_timeout,
            expressed: Arc::new(RwLock::new(HashMap::new())),
            provided: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Broadcast a need and track it until fulfilled or expired. Returns the need id.
    pub async fn express_need(&self, draft: NeedDraft) -> Result<String> {
        let timeout = draft.timeout.unwrap_or(self.default_timeout);
        let created_at = Utc::now();
        let expires_at = deadline_after(created_at, timeout);

        let mut envelope = Envelope::need_expression(
            self.outbox.agent_id().clone(),
            draft.need_type.clone(),
            draft.description.clone(),
            &draft.required_capabilities,
        )
        .with_urgency(draft.urgency);
        if !draft.context.is_empty() {
            envelope
                .payload
                .insert("context".to_string(), Value::Object(draft.context.clone()));
        }
        envelope
            .payload
            .insert("expires_at".to_string(), Value::String(expires_at.to_rfc3339()));
        let need_id = envelope.id.clone();

        self.expressed.write().await.insert(
            need_id.clone(),
            ExpressedNeed {
                need_id: need_id.clone(),
                need_type: draft.need_type.clone(),
                description: draft.description,
                required_capabilities: draft.required_capabilities,
                context: draft.context,
                urgency: draft.urgency,
                created_at,
                expires_at,
                status: NeedStatus::Pending,
                fulfillments: Vec::new(),
            },
        );

        if let Err(e) = self.outbox.send(&envelope).await {
            self.expressed.write().await.remove(&need_id);
            return Err(e);
        }

        info!(
            "Agent {} expressed {} need {}",
            self.outbox.agent_id(),
            draft.need_type,
            need_id
        );

        let expressed = self.expressed.clone();
        let id = need_id.clone();
        self.timers.schedule(timeout, async move {
            let mut expressed = expressed.write().await;
            if let Some(need) = expressed.get_mut(&id) {
                if need.status == NeedStatus::Pending {
                    need.status = NeedStatus::Expired;
                    warn!("Need {} expired without fulfillment", id);
                }
            }
        });

        Ok(need_id)
    }

    /// Send a fulfillment for another agent's need
    pub async fn fulfill_need(&self, need_id: &str, requester: &AgentId, data: Payload) -> Result<String> {
        let envelope = Envelope::need_fulfillment(
            self.outbox.agent_id().clone(),
            requester.clone(),
            need_id,
            data.clone(),
        );
        self.outbox.send(&envelope).await?;

        self.provided.write().await.push(ProvidedFulfillment {
            need_id: need_id.to_string(),
            requester: requester.clone(),
            data,
            created_at: Utc::now(),
        });

        debug!("Agent {} fulfilled need {} for {}", self.outbox.agent_id(), need_id, requester);
        Ok(envelope.id)
    }

    /// Record a NeedFulfillment. Returns whether it matched an expressed need.
    pub async fn handle_fulfillment(&self, envelope: &Envelope) -> bool {
        let need_id = envelope
            .correlation_id
            .as_deref()
            .or_else(|| envelope.payload_str("need_id"));
        let Some(need_id) = need_id else {
            debug!("Need fulfillment {} carries no need id", envelope.id);
            return false;
        };

        let mut expressed = self.expressed.write().await;
        let Some(need) = expressed.get_mut(need_id) else {
            debug!("Ignoring fulfillment {} for unknown need {}", envelope.id, need_id);
            return false;
        };

        need.fulfillments.push(Fulfillment {
            provider: envelope.sender.clone(),
            data: envelope.payload_object("fulfillment_data"),
            received_at: Utc::now(),
        });
        if need.status != NeedStatus::Fulfilled {
            need.status = NeedStatus::Fulfilled;
            info!("Need {} fulfilled by {}", need_id, envelope.sender);
        } else {
            debug!(
                "Additional fulfillment for need {} from {} ({} total)",
                need_id,
                envelope.sender,
                need.fulfillments.len()
            );
        }
        true
    }

    pub async fn expressed_need(&self, need_id: &str) -> Option<ExpressedNeed> {
        self.expressed.read().await.get(need_id).cloned()
    }

    /// Expressed needs, oldest first, optionally filtered by status and type
    pub async fn expressed_needs(
        &self,
        status: Option<NeedStatus>,
        need_type: Option<&str>,
    ) -> Vec<ExpressedNeed> {
        let mut needs: Vec<ExpressedNeed> = self
            .expressed
            .read()
            .await
            .values()
            .filter(|need| status.is_none_or(|status| need.status == status))
            .filter(|need| need_type.is_none_or(|need_type| need.need_type == need_type))
            .cloned()
            .collect();
        needs.sort_by_key(|need| need.created_at);
        needs
    }

    pub async fn is_own_need(&self, need_id: &str) -> bool {
        self.expressed.read().await.contains_key(need_id)
    }

    /// Fulfillments this agent has sent, optionally for a single need
    pub async fn provided_fulfillments(&self, need_id: Option<&str>) -> Vec<ProvidedFulfillment> {
        self.provided
            .read()
            .await
            .iter()
            .filter(|provided| need_id.is_none_or(|id| provided.need_id == id))
            .cloned()
            .collect()
    }
}
