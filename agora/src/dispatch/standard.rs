//! Default handlers installed on every agent

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{HandlerKey, HandlerSet, MessageHandler};
use crate::agent::{AgentContext, ReceivedFeedback};
use crate::envelope::{Envelope, MessageType};
use crate::needs::{IncomingNeed, NeedResponder, matches_capabilities};

/// Baseline handlers keyed by message type
#[derive(Clone, Default)]
pub struct StandardHandlers {
    need_responder: Option<Arc<dyn NeedResponder>>,
}

impl StandardHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer eligible needs through `responder`
    pub fn with_need_responder(mut self, responder: Arc<dyn NeedResponder>) -> Self {
        self.need_responder = Some(responder);
        self
    }
}

impl HandlerSet for StandardHandlers {
    fn name(&self) -> &str {
        "standard"
    }

    fn handlers(&self) -> HashMap<HandlerKey, Arc<dyn MessageHandler>> {
        let mut handlers: HashMap<HandlerKey, Arc<dyn MessageHandler>> = HashMap::new();

        for message_type in [
            MessageType::Command,
            MessageType::Event,
            MessageType::Request,
            MessageType::Response,
        ] {
            handlers.insert(HandlerKey::of_type(message_type), Arc::new(LogMessage));
        }
        handlers.insert(HandlerKey::of_type(MessageType::Notification), Arc::new(LogNotification));
        handlers.insert(HandlerKey::of_type(MessageType::Feedback), Arc::new(StoreFeedback));
        handlers.insert(
            HandlerKey::of_type(MessageType::AssistanceRequest),
            Arc::new(UnhandledAssistanceRequest),
        );
        handlers.insert(
            HandlerKey::of_type(MessageType::AssistanceResponse),
            Arc::new(TrackAssistanceResponse),
        );
        handlers.insert(
            HandlerKey::of_type(MessageType::NeedExpression),
            Arc::new(SelectNeed {
                responder: self.need_responder.clone(),
            }),
        );
        handlers.insert(
            HandlerKey::of_type(MessageType::NeedFulfillment),
            Arc::new(TrackNeedFulfillment),
        );

        handlers
    }
}

struct LogMessage;

#[async_trait]
impl MessageHandler for LogMessage {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        debug!(
            "Agent {} received {} {} from {}",
            ctx.id(),
            envelope.message_type,
            envelope.id,
            envelope.sender
        );
        Ok(())
    }
}

struct LogNotification;

#[async_trait]
impl MessageHandler for LogNotification {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        if envelope.is_error_notification() {
            warn!(
                "Agent {} notified by {} that {} failed: {}",
                ctx.id(),
                envelope.sender,
                envelope.correlation_id.as_deref().unwrap_or("?"),
                envelope.payload_str("error").unwrap_or("unknown error")
            );
        } else {
            debug!("Agent {} received notification {} from {}", ctx.id(), envelope.id, envelope.sender);
        }
        Ok(())
    }
}

/// Keep feedback on the agent and forward it to the feedback manager, if any
struct StoreFeedback;

#[async_trait]
impl MessageHandler for StoreFeedback {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        let about_message_id = envelope
            .payload_str("about_message_id")
            .or(envelope.correlation_id.as_deref())
            .unwrap_or_default()
            .to_string();
        let feedback_data = envelope.payload_object("feedback_data");

        ctx.store_received_feedback(
            &about_message_id,
            ReceivedFeedback {
                sender: envelope.sender.clone(),
                feedback_data: feedback_data.clone(),
                received_at: Utc::now(),
            },
        )
        .await;

        if let Some(manager) = ctx.feedback_manager() {
            manager
                .record_feedback(
                    &envelope.sender,
                    ctx.id(),
                    feedback_data,
                    envelope.payload_str("content_id"),
                    Some(about_message_id.as_str()).filter(|id| !id.is_empty()),
                    envelope.payload_str("feedback_type"),
                )
                .await?;
        }

        info!("Agent {} received feedback from {} about {}", ctx.id(), envelope.sender, about_message_id);
        Ok(())
    }
}

struct UnhandledAssistanceRequest;

#[async_trait]
impl MessageHandler for UnhandledAssistanceRequest {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        warn!(
            "Agent {} has no handler for {} assistance request {} from {}",
            ctx.id(),
            envelope.payload_str("request_type").unwrap_or("untyped"),
            envelope.id,
            envelope.sender
        );
        Ok(())
    }
}

struct TrackAssistanceResponse;

#[async_trait]
impl MessageHandler for TrackAssistanceResponse {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        ctx.requests().handle_response(envelope).await;
        Ok(())
    }
}

struct TrackNeedFulfillment;

#[async_trait]
impl MessageHandler for TrackNeedFulfillment {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        ctx.needs().handle_fulfillment(envelope).await;
        Ok(())
    }
}

/// Decentralized need matching: decide locally whether to answer
struct SelectNeed {
    responder: Option<Arc<dyn NeedResponder>>,
}

#[async_trait]
impl MessageHandler for SelectNeed {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        if envelope.sender == *ctx.id() || ctx.needs().is_own_need(&envelope.id).await {
            return Ok(());
        }

        let need = IncomingNeed::from_envelope(envelope);
        if !matches_capabilities(&need.required_capabilities, ctx.capabilities()) {
            debug!(
                "Agent {} not eligible for need {} ({:?})",
                ctx.id(),
                need.need_id,
                need.required_capabilities
            );
            return Ok(());
        }
        if need.is_expired() {
            debug!("Agent {} skipping expired need {}", ctx.id(), need.need_id);
            return Ok(());
        }

        let Some(responder) = &self.responder else {
            debug!("Agent {} eligible for need {} but has no responder", ctx.id(), need.need_id);
            return Ok(());
        };

        match responder.respond(ctx, &need).await? {
            Some(data) => {
                ctx.needs().fulfill_need(&need.need_id, &need.requester, data).await?;
                info!("Agent {} answered {} need {}", ctx.id(), need.need_type, need.need_id);
            }
            None => debug!("Agent {} declined need {}", ctx.id(), need.need_id),
        }
        Ok(())
    }
}
