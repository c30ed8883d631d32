//! Agent lifecycle state and message metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Built but not started
    Initializing,

    /// Running and waiting for messages
    Idle,

    /// Processing a message
    Busy,

    /// Running but not dequeuing
    Paused,

    /// Shutting down
    Stopping,

    /// Terminal
    Stopped,

    /// Last message failed; the loop keeps running
    Error,
}

impl AgentState {
    /// States in which the message loop and poller are alive
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy | Self::Paused | Self::Error)
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Observable state cell shared by the agent handle and its tasks
#[derive(Debug, Clone)]
pub struct StateCell {
    tx: std::sync::Arc<watch::Sender<AgentState>>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AgentState::Initializing);
        Self { tx: std::sync::Arc::new(tx) }
    }

    pub fn get(&self) -> AgentState {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<AgentState> {
        self.tx.subscribe()
    }

    /// Unconditionally set the state
    pub(crate) fn set(&self, state: AgentState) {
        self.tx.send_replace(state);
    }

    /// Apply `transition` atomically; returns the previous state when it fired
    pub(crate) fn transition(
        &self,
        transition: impl FnOnce(AgentState) -> Option<AgentState>,
    ) -> Option<AgentState> {
        let mut previous = None;
        self.tx.send_if_modified(|state| match transition(*state) {
            Some(next) => {
                previous = Some(*state);
                *state = next;
                true
            }
            None => false,
        });
        previous
    }

    /// Idle or Error -> Busy. Paused and shutdown states are left alone
    pub(crate) fn begin_processing(&self) {
        self.transition(|state| match state {
            AgentState::Idle | AgentState::Error => Some(AgentState::Busy),
            _ => None,
        });
    }

    /// Busy -> Idle on success, Busy -> Error on failure
    pub(crate) fn finish_processing(&self, succeeded: bool) {
        self.transition(|state| match state {
            AgentState::Busy | AgentState::Error => Some(if succeeded {
                AgentState::Idle
            } else {
                AgentState::Error
            }),
            _ => None,
        });
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Message processing counters
#[derive(Debug)]
pub struct MessageMetrics {
    pub messages_handled: AtomicU64,
    pub messages_unhandled: AtomicU64,
    pub handler_failures: AtomicU64,
    pub decode_failures: AtomicU64,
    pub avg_handling_us: AtomicU64,
}

impl MessageMetrics {
    pub fn new() -> Self {
        Self {
            messages_handled: AtomicU64::new(0),
            messages_unhandled: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            avg_handling_us: AtomicU64::new(0),
        }
    }

    pub fn record_handled(&self, elapsed: Duration) {
        let handled = self.messages_handled.fetch_add(1, Ordering::Relaxed) + 1;
        let current_avg = self.avg_handling_us.load(Ordering::Relaxed);
        let elapsed_us = elapsed.as_micros() as u64;
        let new_avg = ((current_avg * (handled - 1)) + elapsed_us) / handled;
        self.avg_handling_us.store(new_avg, Ordering::Relaxed);
    }

    pub fn record_unhandled(&self) {
        self.messages_unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            messages_unhandled: self.messages_unhandled.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            avg_handling_us: self.avg_handling_us.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        }
    }
}

impl Default for MessageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`MessageMetrics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_handled: u64,
    pub messages_unhandled: u64,
    pub handler_failures: u64,
    pub decode_failures: u64,
    pub avg_handling_us: u64,
    pub timestamp: DateTime<Utc>,
}
