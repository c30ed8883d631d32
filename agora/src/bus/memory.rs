//! In-process broker
//!
//! A per-topic append-only log with stream-style ids (`<millis>-<seq>`) and
//! optional retention. Each [`MemoryBus`] client keeps its own cursors, so
//! several agents can read the same topic independently. The availability
//! switch lets tests simulate an unreachable broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{BusError, BusFactory, MessageBus, Result};
use crate::envelope::WireMessage;

#[derive(Debug, Default)]
struct TopicLog {
    /// Absolute offset of the first retained entry
    base: u64,
    entries: VecDeque<(String, WireMessage)>,
}

impl TopicLog {
    fn tail(&self) -> u64 {
        self.base + self.entries.len() as u64
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    last_millis: i64,
    sequence: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> String {
        let now = Utc::now().timestamp_millis();
        if now > self.last_millis {
            self.last_millis = now;
            self.sequence = 0;
        } else {
            self.sequence += 1;
        }
        format!("{}-{}", self.last_millis, self.sequence)
    }
}

/// Shared in-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    available: Arc<AtomicBool>,
    retention: Option<usize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BrokerState::default())),
            available: Arc::new(AtomicBool::new(true)),
            retention: None,
        }
    }

    /// Keep at most `max_len` entries per topic
    pub fn with_retention(mut self, max_len: usize) -> Self {
        self.retention = Some(max_len.max(1));
        self
    }

    /// Create a client with its own cursors
    pub fn bus(&self) -> MemoryBus {
        MemoryBus {
            broker: self.clone(),
            cursors: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Toggle whether the broker accepts publishes and reads
    pub fn set_available(&self, available: bool) {
        info!("Memory broker availability set to {}", available);
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of retained messages on a topic
    pub async fn topic_len(&self, topic: &str) -> usize {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    async fn append(&self, topic: &str, message: WireMessage) -> String {
        let mut state = self.state.write().await;
        let id = state.next_id();
        let log = state.topics.entry(topic.to_string()).or_default();
        log.entries.push_back((id.clone(), message));

        if let Some(max_len) = self.retention {
            while log.entries.len() > max_len {
                log.entries.pop_front();
                log.base += 1;
            }
        }
        id
    }

    async fn tail(&self, topic: &str) -> u64 {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map(TopicLog::tail)
            .unwrap_or(0)
    }

    /// Entries from absolute offset `from`, plus the new cursor
    async fn read_from(&self, topic: &str, from: u64) -> (Vec<WireMessage>, u64) {
        let state = self.state.read().await;
        let Some(log) = state.topics.get(topic) else {
            return (Vec::new(), from);
        };

        // Entries dropped by retention are skipped
        let start = from.max(log.base);
        let skip = (start - log.base) as usize;
        let messages = log
            .entries
            .iter()
            .skip(skip)
            .map(|(_, message)| message.clone())
            .collect();
        (messages, log.tail())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BusFactory for MemoryBroker {
    fn client(&self) -> Arc<dyn MessageBus> {
        Arc::new(self.bus())
    }
}

/// Client of a [`MemoryBroker`]
pub struct MemoryBus {
    broker: MemoryBroker,
    /// topic -> absolute offset of the next unread entry
    cursors: RwLock<HashMap<String, u64>>,
    connected: AtomicBool,
}

impl MemoryBus {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.ensure_connected()?;
        let tail = self.broker.tail(topic).await;
        self.cursors.write().await.insert(topic.to_string(), tail);
        debug!("Pinned cursor for {} at {}", topic, tail);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: WireMessage) -> Result<String> {
        self.ensure_connected()?;
        if !self.broker.is_available() {
            return Err(BusError::DeliveryFailure {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        Ok(self.broker.append(topic, message).await)
    }

    async fn read(&self, topic: &str) -> Result<Vec<WireMessage>> {
        self.ensure_connected()?;
        if !self.broker.is_available() {
            return Err(BusError::PollFailure {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }

        // Unpinned topics are read from the start of the retained log
        let from = self.cursors.read().await.get(topic).copied().unwrap_or(0);
        let (messages, cursor) = self.broker.read_from(topic, from).await;
        self.cursors.write().await.insert(topic.to_string(), cursor);
        Ok(messages)
    }
}
