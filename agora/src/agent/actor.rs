//! Agent lifecycle, message loop and topic poller

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AgentContext, AgentError, AgentState, Outbox, Result, TimerScope};
use crate::bus::{AGENT_STARTED, AGENT_STOPPED, AGENT_STOPPING, BROADCAST_TOPIC, MessageBus, agent_topic};
use crate::config::{RuntimeConfig, TeachingConfig};
use crate::dispatch::{DispatchTable, Dispatched, HandlerSet, StandardHandlers};
use crate::envelope::{self, AgentId, Envelope, payload_from};
use crate::feedback::FeedbackManager;
use crate::needs::NeedResponder;

/// Hooks run around an agent's lifetime
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Runs at the start of `start()`; a failure aborts the start
    async fn initialize(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs during `stop()` after all tasks have exited; failures are logged
    async fn cleanup(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Behavior with no hooks
pub struct NoopBehavior;

impl AgentBehavior for NoopBehavior {}

/// Snapshot of an agent for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub capabilities: Vec<String>,
    pub state: AgentState,
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    id: Option<AgentId>,
    name: String,
    capabilities: BTreeSet<String>,
    topics: Vec<String>,
    standard_handlers: bool,
    handler_sets: Vec<Box<dyn HandlerSet>>,
    need_responder: Option<Arc<dyn NeedResponder>>,
    feedback: Option<Arc<FeedbackManager>>,
    behavior: Arc<dyn AgentBehavior>,
    runtime: RuntimeConfig,
    teaching: TeachingConfig,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            capabilities: BTreeSet::new(),
            topics: Vec::new(),
            standard_handlers: true,
            handler_sets: Vec::new(),
            need_responder: None,
            feedback: None,
            behavior: Arc::new(NoopBehavior),
            runtime: RuntimeConfig::default(),
            teaching: TeachingConfig::default(),
        }
    }

    /// Fixed id instead of a generated `agent-<8 hex>`
    pub fn id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Extra topic beyond the unicast and broadcast defaults
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Add a handler set. Sets are merged in the order given, after the
    /// standard handlers, and later sets win on identical keys.
    pub fn handlers(mut self, set: impl HandlerSet + 'static) -> Self {
        self.handler_sets.push(Box::new(set));
        self
    }

    /// Leave out [`StandardHandlers`]
    pub fn without_standard_handlers(mut self) -> Self {
        self.standard_handlers = false;
        self
    }

    pub fn need_responder(mut self, responder: Arc<dyn NeedResponder>) -> Self {
        self.need_responder = Some(responder);
        self
    }

    pub fn feedback_manager(mut self, manager: Arc<FeedbackManager>) -> Self {
        self.feedback = Some(manager);
        self
    }

    pub fn behavior(mut self, behavior: Arc<dyn AgentBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime = config;
        self
    }

    pub fn teaching_config(mut self, config: TeachingConfig) -> Self {
        self.teaching = config;
        self
    }

    /// Build the agent on its own bus client
    pub fn build(self, bus: Arc<dyn MessageBus>) -> Agent {
        let id = self.id.unwrap_or_default();
        let shutdown = CancellationToken::new();
        let timers = TimerScope::new(&shutdown);
        let outbox = Outbox::new(id.clone(), bus.clone());

        let mut sets: Vec<Box<dyn HandlerSet>> = Vec::with_capacity(self.handler_sets.len() + 1);
        if self.standard_handlers {
            let mut standard = StandardHandlers::new();
            if let Some(responder) = self.need_responder {
                standard = standard.with_need_responder(responder);
            }
            sets.push(Box::new(standard));
        }
        sets.extend(self.handler_sets);
        let dispatch = DispatchTable::compose(&sets);

        let mut topics: BTreeSet<String> = BTreeSet::new();
        topics.insert(agent_topic(&id));
        topics.insert(BROADCAST_TOPIC.to_string());
        topics.extend(self.topics);

        let ctx = AgentContext::new(
            id,
            self.name,
            self.capabilities,
            outbox,
            timers,
            self.feedback,
            self.runtime,
            self.teaching,
        );

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        Agent {
            ctx,
            bus,
            dispatch: Arc::new(dispatch),
            behavior: self.behavior,
            topics: Arc::new(RwLock::new(topics)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            queue_depth: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// A long-lived agent
pub struct Agent {
    ctx: AgentContext,
    bus: Arc<dyn MessageBus>,
    dispatch: Arc<DispatchTable>,
    behavior: Arc<dyn AgentBehavior>,
    topics: Arc<RwLock<BTreeSet<String>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    inbox_tx: mpsc::UnboundedSender<Envelope>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    queue_depth: Arc<AtomicUsize>,
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn id(&self) -> &AgentId {
        self.ctx.id()
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn state(&self) -> AgentState {
        self.ctx.state()
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.ctx.id().clone(),
            name: self.ctx.name().to_string(),
            capabilities: self.ctx.capabilities().iter().cloned().collect(),
            state: self.ctx.state(),
        }
    }

    /// Envelopes polled but not yet dequeued
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    // ==========================================================================
    // Lifecycle
    // ==========================================================================

    /// Initialize, pin cursors, announce `agent.started`, then launch the loop and poller
    pub async fn start(&self) -> Result<()> {
        let state = self.ctx.state();
        if state != AgentState::Initializing {
            return Err(AgentError::InvalidStateTransition {
                from: state,
                to: AgentState::Idle,
            });
        }

        info!("Starting agent {} ({})", self.ctx.id(), self.ctx.name());
        self.bus.connect().await?;

        if let Err(e) = self.behavior.initialize(&self.ctx).await {
            self.ctx.state_cell().set(AgentState::Error);
            error!("Agent {} failed to initialize: {:#}", self.ctx.id(), e);
            return Err(AgentError::InitializationFailed(format!("{:#}", e)));
        }

        for topic in self.topics.read().await.iter() {
            self.bus.subscribe(topic).await?;
        }

        // Announce before any task runs: a failed announcement leaves the
        // agent Initializing with nothing spawned, so `start()` can be retried
        let capabilities: Vec<&String> = self.ctx.capabilities().iter().collect();
        let announced = self
            .ctx
            .outbox()
            .publish_event(
                AGENT_STARTED,
                payload_from(json!({
                    "agent_id": self.ctx.id(),
                    "name": self.ctx.name(),
                    "capabilities": capabilities,
                })),
            )
            .await;
        if let Err(e) = announced {
            error!("Agent {} could not announce start: {}", self.ctx.id(), e);
            if let Err(e) = self.behavior.cleanup(&self.ctx).await {
                warn!("Agent {} cleanup after failed start: {:#}", self.ctx.id(), e);
            }
            return Err(e);
        }

        let inbox = self.inbox_rx.lock().await.take();
        let Some(inbox) = inbox else {
            return Err(AgentError::InvalidStateTransition {
                from: state,
                to: AgentState::Idle,
            });
        };

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(tokio::spawn(run_message_loop(
                self.ctx.clone(),
                self.dispatch.clone(),
                inbox,
                self.shutdown.clone(),
                self.queue_depth.clone(),
            )));
            tasks.push(tokio::spawn(run_topic_poller(
                self.ctx.clone(),
                self.bus.clone(),
                self.topics.clone(),
                self.inbox_tx.clone(),
                self.shutdown.clone(),
                self.queue_depth.clone(),
            )));
        }

        self.ctx.state_cell().set(AgentState::Idle);
        info!("Agent {} started", self.ctx.id());
        Ok(())
    }

    /// Shut down tasks and timers, run cleanup, announce `agent.stopped`.
    ///
    /// Stopping an agent that is already stopping or stopped does nothing.
    pub async fn stop(&self) -> Result<()> {
        let previous = self.ctx.state_cell().transition(|state| match state {
            AgentState::Stopping | AgentState::Stopped => None,
            AgentState::Initializing => Some(AgentState::Stopped),
            _ => Some(AgentState::Stopping),
        });
        let Some(previous) = previous else {
            return Ok(());
        };
        if previous == AgentState::Initializing {
            self.shutdown.cancel();
            debug!("Agent {} stopped before it was started", self.ctx.id());
            return Ok(());
        }

        info!("Stopping agent {}", self.ctx.id());
        let lifecycle = payload_from(json!({ "agent_id": self.ctx.id(), "name": self.ctx.name() }));

        if let Err(e) = self.ctx.outbox().publish_event(AGENT_STOPPING, lifecycle.clone()).await {
            warn!("Agent {} could not announce stopping: {}", self.ctx.id(), e);
        }

        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Agent {} task ended abnormally: {}", self.ctx.id(), e);
            }
        }
        self.ctx.timers().shutdown().await;

        if let Err(e) = self.behavior.cleanup(&self.ctx).await {
            error!("Agent {} cleanup failed: {:#}", self.ctx.id(), e);
        }

        self.ctx.state_cell().set(AgentState::Stopped);

        if let Err(e) = self.ctx.outbox().publish_event(AGENT_STOPPED, lifecycle).await {
            warn!("Agent {} could not announce stop: {}", self.ctx.id(), e);
        }
        if let Err(e) = self.bus.disconnect().await {
            warn!("Agent {} failed to disconnect: {}", self.ctx.id(), e);
        }

        info!("Agent {} stopped", self.ctx.id());
        Ok(())
    }

    /// Stop dequeuing; the poller keeps filling the queue
    pub fn pause(&self) -> Result<()> {
        let previous = self.ctx.state_cell().transition(|state| match state {
            AgentState::Idle | AgentState::Busy | AgentState::Error => Some(AgentState::Paused),
            _ => None,
        });
        match previous {
            Some(_) => {
                info!("Agent {} paused", self.ctx.id());
                Ok(())
            }
            None => Err(AgentError::InvalidStateTransition {
                from: self.ctx.state(),
                to: AgentState::Paused,
            }),
        }
    }

    pub fn resume(&self) -> Result<()> {
        let previous = self.ctx.state_cell().transition(|state| {
            (state == AgentState::Paused).then_some(AgentState::Idle)
        });
        match previous {
            Some(_) => {
                info!("Agent {} resumed", self.ctx.id());
                Ok(())
            }
            None => Err(AgentError::InvalidStateTransition {
                from: self.ctx.state(),
                to: AgentState::Idle,
            }),
        }
    }

    // ==========================================================================
    // Topics
    // ==========================================================================

    /// Add a topic to the poller. A running agent pins its cursor immediately.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        if self.ctx.state().is_running() {
            self.bus.subscribe(&topic).await?;
        }
        self.topics.write().await.insert(topic);
        Ok(())
    }

    /// Returns whether the topic was subscribed
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        self.topics.write().await.remove(topic)
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.topics.read().await.iter().cloned().collect()
    }

    // ==========================================================================
    // Outbound
    // ==========================================================================

    pub async fn send(&self, envelope: &Envelope) -> Result<String> {
        self.ctx.outbox().send(envelope).await
    }

    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<String> {
        self.ctx.outbox().publish(topic, envelope).await
    }

    pub async fn publish_event(&self, name: &str, data: envelope::Payload) -> Result<String> {
        self.ctx.outbox().publish_event(name, data).await
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ==============================================================================
// Tasks
// ==============================================================================

async fn run_message_loop(
    ctx: AgentContext,
    dispatch: Arc<DispatchTable>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    shutdown: CancellationToken,
    queue_depth: Arc<AtomicUsize>,
) {
    let mut state = ctx.state_cell().watch();

    loop {
        let envelope = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = inbox.recv() => match received {
                Some(envelope) => envelope,
                None => break,
            },
        };
        queue_depth.fetch_sub(1, Ordering::Relaxed);

        // Hold the envelope while paused
        let resumed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            resumed = state.wait_for(|state| *state != AgentState::Paused) => resumed.is_ok(),
        };
        if !resumed {
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = process_envelope(&ctx, &dispatch, envelope) => {}
        }
    }

    debug!("Message loop for agent {} exited", ctx.id());
}

async fn process_envelope(ctx: &AgentContext, dispatch: &DispatchTable, envelope: Envelope) {
    ctx.state_cell().begin_processing();
    let started = Instant::now();

    let outcome = AssertUnwindSafe(dispatch.dispatch(ctx, &envelope))
        .catch_unwind()
        .await;
    let result = match outcome {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref()))),
    };

    match result {
        Ok(Dispatched::Handled) => {
            ctx.metrics().record_handled(started.elapsed());
            ctx.state_cell().finish_processing(true);
        }
        Ok(Dispatched::Unhandled) => {
            ctx.metrics().record_unhandled();
            ctx.state_cell().finish_processing(true);
        }
        Err(e) => {
            ctx.metrics().record_failure();
            ctx.state_cell().finish_processing(false);
            error!(
                "Agent {} failed to handle {} {} from {}: {:#}",
                ctx.id(),
                envelope.message_type,
                envelope.id,
                envelope.sender,
                e
            );
            notify_failure(ctx, &envelope, &e).await;
        }
    }
}

/// Best-effort error notification to the envelope's reply address
async fn notify_failure(ctx: &AgentContext, envelope: &Envelope, err: &anyhow::Error) {
    // Never answer an error notification with another one
    if envelope.is_error_notification() {
        return;
    }
    let Some(recipient) = envelope.reply_address().cloned() else {
        return;
    };

    let notification = Envelope::error_notification(
        ctx.id().clone(),
        recipient.clone(),
        envelope.id.clone(),
        format!("{:#}", err),
    );
    if let Err(e) = ctx.send(&notification).await {
        warn!(
            "Agent {} could not notify {} about failed {}: {}",
            ctx.id(),
            recipient,
            envelope.id,
            e
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_topic_poller(
    ctx: AgentContext,
    bus: Arc<dyn MessageBus>,
    topics: Arc<RwLock<BTreeSet<String>>>,
    inbox: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
    queue_depth: Arc<AtomicUsize>,
) {
    let config = ctx.runtime_config().clone();

    loop {
        let mut delay = config.poll_interval();
        let current: Vec<String> = topics.read().await.iter().cloned().collect();

        for topic in &current {
            let messages = match bus.read(topic).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Agent {} failed to poll {}: {}", ctx.id(), topic, e);
                    delay = config.error_backoff();
                    break;
                }
            };

            for wire in messages {
                let envelope = match envelope::decode(&wire) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        ctx.metrics().record_decode_failure();
                        warn!("Agent {} skipping undecodable message on {}: {}", ctx.id(), topic, e);
                        continue;
                    }
                };

                // Count before sending so the loop never decrements below zero
                let depth = queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
                if inbox.send(envelope).is_err() {
                    queue_depth.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                if config.queue_warn_threshold > 0 && depth == config.queue_warn_threshold {
                    warn!("Agent {} inbound queue reached {} envelopes", ctx.id(), depth);
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Topic poller for agent {} exited", ctx.id());
}
