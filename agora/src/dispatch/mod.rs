//! Handler Composition / Dispatch Table
//!
//! Capability modules contribute handlers as [`HandlerSet`]s. An agent merges
//! its sets once, in the order its builder received them, into a
//! [`DispatchTable`]. A later set replaces an earlier one for an identical key.
//!
//! Lookup for an envelope tries the exact `(type, intent)` key, then the
//! intent alone, then the type alone.

pub mod standard;
pub mod teaching;

pub use standard::StandardHandlers;
pub use teaching::{ContentReview, ReviewOutcome, TeachingHandlers, TeachingPatterns};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::agent::AgentContext;
use crate::envelope::{Envelope, MessageIntent, MessageType};

/// Routing key of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub message_type: Option<MessageType>,
    pub intent: Option<MessageIntent>,
}

impl HandlerKey {
    pub fn new(message_type: MessageType, intent: MessageIntent) -> Self {
        Self {
            message_type: Some(message_type),
            intent: Some(intent),
        }
    }

    pub fn of_type(message_type: MessageType) -> Self {
        Self {
            message_type: Some(message_type),
            intent: None,
        }
    }

    pub fn of_intent(intent: MessageIntent) -> Self {
        Self {
            message_type: None,
            intent: Some(intent),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message_type, self.intent) {
            (Some(t), Some(i)) => write!(f, "{}+{}", t, i),
            (Some(t), None) => write!(f, "{}", t),
            (None, Some(i)) => write!(f, "intent:{}", i),
            (None, None) => f.write_str("*"),
        }
    }
}

/// Async handler for one kind of envelope
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(AgentContext, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<()> {
        (self.0)(ctx.clone(), envelope.clone()).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(AgentContext, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A named group of handlers contributed by one capability
pub trait HandlerSet: Send + Sync {
    fn name(&self) -> &str;

    fn handlers(&self) -> HashMap<HandlerKey, Arc<dyn MessageHandler>>;
}

/// Ad-hoc handler set for application code
pub struct HandlerMap {
    name: String,
    handlers: HashMap<HandlerKey, Arc<dyn MessageHandler>>,
}

impl HandlerMap {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn on(mut self, key: HandlerKey, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(key, handler);
        self
    }

    pub fn on_fn<F, Fut>(self, key: HandlerKey, f: F) -> Self
    where
        F: Fn(AgentContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on(key, handler_fn(f))
    }
}

impl HandlerSet for HandlerMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn handlers(&self) -> HashMap<HandlerKey, Arc<dyn MessageHandler>> {
        self.handlers.clone()
    }
}

/// Result of routing one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    Unhandled,
}

struct Registration {
    set: String,
    handler: Arc<dyn MessageHandler>,
}

/// Merged handlers of one agent
pub struct DispatchTable {
    handlers: HashMap<HandlerKey, Registration>,
}

impl DispatchTable {
    /// Merge sets in order; later sets win on identical keys
    pub fn compose(sets: &[Box<dyn HandlerSet>]) -> Self {
        let mut handlers: HashMap<HandlerKey, Registration> = HashMap::new();
        for set in sets {
            for (key, handler) in set.handlers() {
                let registration = Registration {
                    set: set.name().to_string(),
                    handler,
                };
                if let Some(previous) = handlers.insert(key, registration) {
                    debug!(
                        "Handler for {} from {} replaced by {}",
                        key,
                        previous.set,
                        set.name()
                    );
                }
            }
        }
        Self { handlers }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Name of the set that owns `key`
    pub fn owner(&self, key: &HandlerKey) -> Option<&str> {
        self.handlers.get(key).map(|r| r.set.as_str())
    }

    /// Exact key, then intent-only, then type-only
    pub fn lookup(&self, envelope: &Envelope) -> Option<&Arc<dyn MessageHandler>> {
        let mut candidates = Vec::with_capacity(3);
        if let Some(intent) = envelope.intent {
            candidates.push(HandlerKey::new(envelope.message_type, intent));
            candidates.push(HandlerKey::of_intent(intent));
        }
        candidates.push(HandlerKey::of_type(envelope.message_type));

        candidates
            .iter()
            .find_map(|key| self.handlers.get(key))
            .map(|registration| &registration.handler)
    }

    /// Route an envelope. Unknown keys are logged and dropped.
    pub async fn dispatch(&self, ctx: &AgentContext, envelope: &Envelope) -> anyhow::Result<Dispatched> {
        let Some(handler) = self.lookup(envelope) else {
            warn!(
                "Agent {} has no handler for {} (intent {:?}), dropping {}",
                ctx.id(),
                envelope.message_type,
                envelope.intent,
                envelope.id
            );
            return Ok(Dispatched::Unhandled);
        };

        handler.handle(ctx, envelope).await?;
        Ok(Dispatched::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _ctx: &AgentContext, _envelope: &Envelope) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn set(name: &str, keys: &[HandlerKey]) -> Box<dyn HandlerSet> {
        let map = keys
            .iter()
            .fold(HandlerMap::new(name), |map, key| map.on(*key, Arc::new(Noop)));
        Box::new(map)
    }

    #[test]
    fn test_last_registration_wins() {
        let key = HandlerKey::of_type(MessageType::Command);
        let table = DispatchTable::compose(&[set("first", &[key]), set("second", &[key])]);

        assert_eq!(table.len(), 1);
        assert_eq!(table.owner(&key), Some("second"));
    }

    #[test]
    fn test_lookup_order() {
        let exact = HandlerKey::new(MessageType::Notification, MessageIntent::KnowledgeGap);
        let intent = HandlerKey::of_intent(MessageIntent::KnowledgeGap);
        let by_type = HandlerKey::of_type(MessageType::Notification);
        let table = DispatchTable::compose(&[
            set("exact", &[exact]),
            set("intent", &[intent]),
            set("type", &[by_type]),
        ]);

        let gap = Envelope::direct("a", "b", Payload::new()).with_intent(MessageIntent::KnowledgeGap);
        let found = table.lookup(&gap).unwrap();
        assert!(Arc::ptr_eq(found, &table.handlers[&exact].handler));

        let other_type = Envelope::new(MessageType::Command, "a").with_intent(MessageIntent::KnowledgeGap);
        let found = table.lookup(&other_type).unwrap();
        assert!(Arc::ptr_eq(found, &table.handlers[&intent].handler));

        let plain = Envelope::direct("a", "b", Payload::new());
        let found = table.lookup(&plain).unwrap();
        assert!(Arc::ptr_eq(found, &table.handlers[&by_type].handler));

        let unknown = Envelope::new(MessageType::Learning, "a");
        assert!(table.lookup(&unknown).is_none());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(HandlerKey::of_type(MessageType::Feedback).to_string(), "feedback");
        assert_eq!(
            HandlerKey::of_intent(MessageIntent::ContentRequest).to_string(),
            "intent:content_request"
        );
        assert_eq!(
            HandlerKey::new(MessageType::Notification, MessageIntent::Inform).to_string(),
            "notification+inform"
        );
    }
}
