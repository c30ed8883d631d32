//! Shared helpers for the Agora integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use agora::agent::{Agent, AgentBuilder, AgentContext};
use agora::bus::MemoryBroker;
use agora::config::RuntimeConfig;
use agora::dispatch::{HandlerKey, HandlerMap};
use agora::envelope::Envelope;

/// Runtime settings that keep the tests fast
pub fn fast_runtime() -> RuntimeConfig {
    RuntimeConfig {
        poll_interval_ms: 10,
        error_backoff_ms: 50,
        ..Default::default()
    }
}

/// Builder with a fixed id and fast polling
pub fn builder(id: &str) -> AgentBuilder {
    AgentBuilder::new(id).id(id).runtime_config(fast_runtime())
}

/// Build on a fresh client of `broker` and start
pub async fn start(broker: &MemoryBroker, builder: AgentBuilder) -> Agent {
    let agent = builder.build(Arc::new(broker.bus()));
    agent.start().await.expect("agent should start");
    agent
}

/// Poll `check` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Envelopes captured by a recording handler
#[derive(Clone, Default)]
pub struct Inbox {
    received: Arc<Mutex<Vec<Envelope>>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler set that records every envelope matching `key`
    pub fn recorder(&self, name: &str, key: HandlerKey) -> HandlerMap {
        let received = self.received.clone();
        HandlerMap::new(name).on_fn(key, move |_ctx: AgentContext, envelope: Envelope| {
            let received = received.clone();
            async move {
                received.lock().await.push(envelope);
                Ok(())
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.received.lock().await.len()
    }

    pub async fn all(&self) -> Vec<Envelope> {
        self.received.lock().await.clone()
    }

    /// Wait for at least `count` envelopes
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, move || async move { self.len().await >= count }).await
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
