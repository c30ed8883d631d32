//! Request-Response Tracker
//!
//! Correlates outgoing assistance requests with their responses. Each request
//! is recorded as a [`PendingRequest`] keyed by the request envelope id and is
//! expired by a timer in the owning agent's scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};

use crate::agent::{AgentError, Outbox, Result, TimerScope};
use crate::envelope::{AgentId, Envelope, EnvelopeError, Payload, Urgency};

/// Lifecycle of a tracked request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Fulfilled,
    Expired,
}

/// Response stored against a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistanceReply {
    pub responder: AgentId,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,

    /// The response arrived after the request had already expired
    pub after_expiry: bool,
}

/// An outgoing assistance request awaiting a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: String,
    pub recipient: AgentId,
    pub request_type: String,
    pub context: Payload,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RequestStatus,
    pub response: Option<AssistanceReply>,
}

/// Tracks the assistance requests an agent has sent
#[derive(Clone)]
pub struct RequestTracker {
    outbox: Outbox,
    timers: TimerScope,
    default_timeout: Duration,
    requests: Arc<RwLock<HashMap<String, PendingRequest>>>,
    waiters: Arc<RwLock<HashMap<String, Vec<oneshot::Sender<AssistanceReply>>>>>,
}

impl RequestTracker {
    pub fn new(outbox: Outbox, timers: TimerScope, default_timeout: Duration) -> Self {
        Self {
            outbox,
            timers,
            default_timeout,
            requests: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Send an assistance request and track it until answered or expired.
    ///
    /// Returns the request envelope id. `timeout` falls back to the configured
    /// default. When the send fails the record is dropped and the error returned.
    pub async fn request_assistance(
        &self,
        recipient: &AgentId,
        request_type: &str,
        context: Payload,
        timeout: Option<Duration>,
        urgency: Urgency,
    ) -> Result<String> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let created_at = Utc::now();
        let expires_at = deadline_after(created_at, timeout);

        let request = Envelope::assistance_request(
            self.outbox.agent_id().clone(),
            recipient.clone(),
            request_type,
            context.clone(),
        )
        .with_urgency(urgency)
        .requiring_response_by(expires_at);
        let request_id = request.id.clone();

        self.requests.write().await.insert(
            request_id.clone(),
            PendingRequest {
                request_id: request_id.clone(),
                recipient: recipient.clone(),
                request_type: request_type.to_string(),
                context,
                created_at,
                expires_at,
                status: RequestStatus::Pending,
                response: None,
            },
        );

        if let Err(e) = self.outbox.send(&request).await {
            self.requests.write().await.remove(&request_id);
            return Err(e);
        }

        info!(
            "Agent {} requested {} assistance from {} ({})",
            self.outbox.agent_id(),
            request_type,
            recipient,
            request_id
        );

        let requests = self.requests.clone();
        let id = request_id.clone();
        self.timers.schedule(timeout, async move {
            let mut requests = requests.write().await;
            if let Some(request) = requests.get_mut(&id) {
                if request.status == RequestStatus::Pending {
                    request.status = RequestStatus::Expired;
                    warn!("Assistance request {} expired without response", id);
                }
            }
        });

        Ok(request_id)
    }

    /// Record an AssistanceResponse. Returns whether it matched a tracked request.
    pub async fn handle_response(&self, envelope: &Envelope) -> bool {
        let Some(request_id) = envelope.correlation_id.as_deref() else {
            debug!("Assistance response {} has no correlation id", envelope.id);
            return false;
        };

        let reply = {
            let mut requests = self.requests.write().await;
            let Some(request) = requests.get_mut(request_id) else {
                debug!("Ignoring response {} for unknown request {}", envelope.id, request_id);
                return false;
            };

            let after_expiry = request.status == RequestStatus::Expired;
            if after_expiry {
                // Late responses still fulfil the request; the reply is flagged
                warn!(
                    "Response for request {} arrived after expiry from {}",
                    request_id, envelope.sender
                );
            }

            let reply = AssistanceReply {
                responder: envelope.sender.clone(),
                payload: envelope.payload.clone(),
                received_at: Utc::now(),
                after_expiry,
            };
            request.status = RequestStatus::Fulfilled;
            request.response = Some(reply.clone());
            reply
        };

        debug!("Request {} fulfilled by {}", request_id, envelope.sender);

        if let Some(waiters) = self.waiters.write().await.remove(request_id) {
            for waiter in waiters {
                let _ = waiter.send(reply.clone());
            }
        }
        true
    }

    /// Answer an incoming assistance request
    pub async fn respond_to_assistance(&self, request: &Envelope, payload: Payload) -> Result<String> {
        let recipient = request
            .reply_address()
            .cloned()
            .ok_or(AgentError::InvalidEnvelope(EnvelopeError::MissingField("reply_to")))?;

        let response = Envelope::assistance_response(
            self.outbox.agent_id().clone(),
            recipient,
            request.id.clone(),
            payload,
        )
        .with_urgency(request.urgency);

        self.outbox.send(&response).await?;
        Ok(response.id)
    }

    /// Wait up to `timeout` for the response to `request_id`
    pub async fn wait_for_response(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Option<AssistanceReply> {
        let rx = {
            // Hold the request map while registering so a response cannot slip in between
            let requests = self.requests.read().await;
            let request = requests.get(request_id)?;
            if let Some(reply) = &request.response {
                return Some(reply.clone());
            }

            let (tx, rx) = oneshot::channel();
            self.waiters
                .write()
                .await
                .entry(request_id.to_string())
                .or_default()
                .push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => None,
        }
    }

    pub async fn pending_request(&self, request_id: &str) -> Option<PendingRequest> {
        self.requests.read().await.get(request_id).cloned()
    }

    /// Tracked requests, oldest first, optionally filtered by status
    pub async fn pending_requests(&self, status: Option<RequestStatus>) -> Vec<PendingRequest> {
        let mut requests: Vec<PendingRequest> = self
            .requests
            .read()
            .await
            .values()
            .filter(|request| status.is_none_or(|status| request.status == status))
            .cloned()
            .collect();
        requests.sort_by_key(|request| request.created_at);
        requests
    }
}

/// `start + timeout`, saturating at the latest representable instant
pub(crate) fn deadline_after(start: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| start.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, MemoryBroker, MessageBus};
    use crate::envelope::{MessageType, decode, payload_from};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    async fn tracker(broker: &MemoryBroker, id: &str) -> (RequestTracker, CancellationToken) {
        let bus = broker.bus();
        bus.connect().await.unwrap();
        let token = CancellationToken::new();
        let tracker = RequestTracker::new(
            Outbox::new(AgentId::from(id), Arc::new(bus)),
            TimerScope::new(&token),
            Duration::from_secs(60),
        );
        (tracker, token)
    }

    fn response_to(request_id: &str) -> Envelope {
        Envelope::assistance_response(
            "professor",
            "tutor",
            request_id,
            payload_from(json!({ "content": "lesson" })),
        )
    }

    #[tokio::test]
    async fn test_request_is_sent_and_tracked() {
        let broker = MemoryBroker::new();
        let (tracker, _token) = tracker(&broker, "tutor").await;
        let reader = broker.bus();
        reader.connect().await.unwrap();

        let id = tracker
            .request_assistance(
                &AgentId::from("professor"),
                "content-creation",
                payload_from(json!({ "topic": "ml" })),
                None,
                Urgency::High,
            )
            .await
            .unwrap();

        let request = tracker.pending_request(&id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.request_type, "content-creation");

        let sent = reader.read("agent.professor").await.unwrap();
        let envelope = decode(&sent[0]).unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.message_type, MessageType::AssistanceRequest);
        assert_eq!(envelope.urgency, Urgency::High);
        assert!(envelope.requires_response);
        assert!(envelope.response_by.is_some());
    }

    #[tokio::test]
    async fn test_response_fulfils_request() {
        let broker = MemoryBroker::new();
        let (tracker, _token) = tracker(&broker, "tutor").await;

        let id = tracker
            .request_assistance(&AgentId::from("professor"), "help", Payload::new(), None, Urgency::Normal)
            .await
            .unwrap();

        assert!(tracker.handle_response(&response_to(&id)).await);

        let request = tracker.pending_request(&id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Fulfilled);
        let reply = request.response.unwrap();
        assert_eq!(reply.payload["content"], json!("lesson"));
        assert!(!reply.after_expiry);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_ignored() {
        let broker = MemoryBroker::new();
        let (tracker, _token) = tracker(&broker, "tutor").await;

        assert!(!tracker.handle_response(&response_to("unknown")).await);
        assert!(tracker.pending_requests(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_drops_record() {
        let broker = MemoryBroker::new();
        let (tracker, _token) = tracker(&broker, "tutor").await;
        broker.set_available(false);

        let err = tracker
            .request_assistance(&AgentId::from("professor"), "help", Payload::new(), None, Urgency::Normal)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Bus(BusError::DeliveryFailure { .. })));
        assert!(tracker.pending_requests(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_late_response_after_expiry_is_flagged() {
        let broker = MemoryBroker::new();
        let (tracker, _token) = tracker(&broker, "tutor").await;

        let id = tracker
            .request_assistance(
                &AgentId::from("professor"),
                "help",
                Payload::new(),
                Some(Duration::from_millis(50)),
                Urgency::Normal,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            tracker.pending_request(&id).await.unwrap().status,
            RequestStatus::Expired
        );

        tracker.handle_response(&response_to(&id)).await;

        let request = tracker.pending_request(&id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Fulfilled);
        assert!(request.response.unwrap().after_expiry);
    }

    #[tokio::test]
    async fn test_wait_for_response() {
        let broker = MemoryBroker::new();
        let (tracker, _token) = tracker(&broker, "tutor").await;

        let id = tracker
            .request_assistance(&AgentId::from("professor"), "help", Payload::new(), None, Urgency::Normal)
            .await
            .unwrap();

        let waiter = {
            let tracker = tracker.clone();
            let id = id.clone();
            tokio::spawn(async move { tracker.wait_for_response(&id, Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.handle_response(&response_to(&id)).await;

        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.responder, AgentId::from("professor"));

        // Already answered requests return immediately
        assert!(tracker.wait_for_response(&id, Duration::from_millis(1)).await.is_some());
        assert!(tracker.wait_for_response("unknown", Duration::from_millis(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_respond_to_assistance_uses_reply_address() {
        let broker = MemoryBroker::new();
        let (tracker, _token) = tracker(&broker, "professor").await;
        let reader = broker.bus();
        reader.connect().await.unwrap();

        let request = Envelope::assistance_request("tutor", "professor", "help", Payload::new())
            .with_reply_to("tutor-inbox");
        tracker
            .respond_to_assistance(&request, payload_from(json!({ "ok": true })))
            .await
            .unwrap();

        let sent = reader.read("agent.tutor-inbox").await.unwrap();
        let response = decode(&sent[0]).unwrap();
        assert_eq!(response.message_type, MessageType::AssistanceResponse);
        assert_eq!(response.correlation_id.as_deref(), Some(request.id.as_str()));
    }
}
