//! Handle given to message handlers
//!
//! An [`AgentContext`] is a cheap clone of everything a handler may touch on
//! its own agent: identity, outbox, request and need bookkeeping, received
//! feedback, configuration and state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{AgentState, MessageMetrics, Outbox, Result, StateCell, TimerScope};
use crate::config::{RuntimeConfig, TeachingConfig};
use crate::dispatch::TeachingPatterns;
use crate::envelope::{AgentId, Envelope, Payload};
use crate::feedback::FeedbackManager;
use crate::needs::NeedsProtocol;
use crate::requests::RequestTracker;

/// Feedback envelope received by this agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedFeedback {
    pub sender: AgentId,
    pub feedback_data: Payload,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AgentContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: AgentId,
    name: String,
    capabilities: BTreeSet<String>,
    outbox: Outbox,
    timers: TimerScope,
    requests: RequestTracker,
    needs: NeedsProtocol,
    /// about_message_id -> feedback in arrival order
    received_feedback: RwLock<HashMap<String, Vec<ReceivedFeedback>>>,
    feedback: Option<Arc<FeedbackManager>>,
    runtime: RuntimeConfig,
    teaching: TeachingConfig,
    state: StateCell,
    metrics: MessageMetrics,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: AgentId,
        name: String,
        capabilities: BTreeSet<String>,
        outbox: Outbox,
        timers: TimerScope,
        feedback: Option<Arc<FeedbackManager>>,
        runtime: RuntimeConfig,
        teaching: TeachingConfig,
    ) -> Self {
        let requests = RequestTracker::new(outbox.clone(), timers.clone(), runtime.request_timeout());
        let needs = NeedsProtocol::new(outbox.clone(), timers.clone(), runtime.need_timeout());

        Self {
            inner: Arc::new(ContextInner {
                id,
                name,
                capabilities,
                outbox,
                timers,
                requests,
                needs,
                received_feedback: RwLock::new(HashMap::new()),
                feedback,
                runtime,
                teaching,
                state: StateCell::new(),
                metrics: MessageMetrics::new(),
            }),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.inner.capabilities
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.inner.capabilities.contains(capability)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    /// Send to the envelope's recipient, or broadcast
    pub async fn send(&self, envelope: &Envelope) -> Result<String> {
        self.inner.outbox.send(envelope).await
    }

    pub fn timers(&self) -> &TimerScope {
        &self.inner.timers
    }

    pub fn requests(&self) -> &RequestTracker {
        &self.inner.requests
    }

    pub fn needs(&self) -> &NeedsProtocol {
        &self.inner.needs
    }

    pub fn feedback_manager(&self) -> Option<&Arc<FeedbackManager>> {
        self.inner.feedback.as_ref()
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.inner.runtime
    }

    /// Outbound teaching helpers bound to this agent
    pub fn teaching(&self) -> TeachingPatterns<'_> {
        TeachingPatterns::new(self, &self.inner.teaching)
    }

    pub fn state(&self) -> AgentState {
        self.inner.state.get()
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.inner.state
    }

    pub fn metrics(&self) -> &MessageMetrics {
        &self.inner.metrics
    }

    pub(crate) async fn store_received_feedback(&self, about_message_id: &str, feedback: ReceivedFeedback) {
        self.inner
            .received_feedback
            .write()
            .await
            .entry(about_message_id.to_string())
            .or_default()
            .push(feedback);
    }

    /// Feedback received about one of this agent's messages
    pub async fn received_feedback(&self, about_message_id: &str) -> Vec<ReceivedFeedback> {
        self.inner
            .received_feedback
            .read()
            .await
            .get(about_message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn all_received_feedback(&self) -> HashMap<String, Vec<ReceivedFeedback>> {
        self.inner.received_feedback.read().await.clone()
    }
}
