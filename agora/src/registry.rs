//! Capability Registry
//!
//! Directory of running agents built purely from the `agent.started` and
//! `agent.stopped` lifecycle events. There is no bootstrap or replay: the
//! registry only knows about agents that start after it does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{AGENT_STARTED, AGENT_STOPPED, BusError, MessageBus, event_topic};
use crate::config::RuntimeConfig;
use crate::envelope::{self, AgentId, Envelope};

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Active,
    Inactive,
}

/// What the registry knows about one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub agent_id: AgentId,
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: RegistrationStatus,
}

#[derive(Debug, Default)]
struct Directory {
    agents: BTreeMap<AgentId, RegistryEntry>,

    /// capability -> active agents advertising it
    capabilities: BTreeMap<String, BTreeSet<AgentId>>,
}

impl Directory {
    fn unindex(&mut self, agent_id: &AgentId, capabilities: &[String]) {
        for capability in capabilities {
            if let Some(agents) = self.capabilities.get_mut(capability) {
                agents.remove(agent_id);
                if agents.is_empty() {
                    self.capabilities.remove(capability);
                }
            }
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Eventually consistent index of agent capabilities
pub struct CapabilityRegistry {
    bus: Arc<dyn MessageBus>,
    config: RuntimeConfig,
    directory: Arc<RwLock<Directory>>,
    listener: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CapabilityRegistry {
    /// `bus` must be a client of its own; the registry moves its cursors
    pub fn new(bus: Arc<dyn MessageBus>, config: RuntimeConfig) -> Self {
        Self {
            bus,
            config,
            directory: Arc::new(RwLock::new(Directory::default())),
            listener: Mutex::new(None),
        }
    }

    /// Pin cursors on both lifecycle topics and start listening.
    ///
    /// Calling `start()` on a running registry does nothing.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        self.bus.connect().await?;
        self.bus.subscribe(&event_topic(AGENT_STARTED)).await?;
        self.bus.subscribe(&event_topic(AGENT_STOPPED)).await?;

        let token = CancellationToken::new();
        let handle = tokio::spawn(listen(
            self.bus.clone(),
            self.directory.clone(),
            self.config.clone(),
            token.clone(),
        ));
        *listener = Some((token, handle));

        info!("Capability registry started");
        Ok(())
    }

    pub async fn stop(&self) {
        let Some((token, handle)) = self.listener.lock().await.take() else {
            return;
        };

        token.cancel();
        if let Err(e) = handle.await {
            debug!("Registry listener ended abnormally: {}", e);
        }
        if let Err(e) = self.bus.disconnect().await {
            warn!("Registry failed to disconnect: {}", e);
        }
        info!("Capability registry stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.listener.lock().await.is_some()
    }

    /// Apply an `agent.started` event
    pub async fn handle_started(&self, event: &Envelope) {
        apply_started(&self.directory, event).await;
    }

    /// Apply an `agent.stopped` event
    pub async fn handle_stopped(&self, event: &Envelope) {
        apply_stopped(&self.directory, event).await;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<RegistryEntry> {
        self.directory.read().await.agents.get(agent_id).cloned()
    }

    /// Sorted ids of active agents advertising `capability`
    pub async fn get_agents_by_capability(&self, capability: &str) -> Vec<AgentId> {
        self.directory
            .read()
            .await
            .capabilities
            .get(capability)
            .map(|agents| agents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every agent ever seen, active or not, ordered by id
    pub async fn get_all_agents(&self) -> Vec<RegistryEntry> {
        self.directory.read().await.agents.values().cloned().collect()
    }

    /// Sorted capabilities offered by at least one active agent
    pub async fn get_all_capabilities(&self) -> Vec<String> {
        self.directory.read().await.capabilities.keys().cloned().collect()
    }
}

impl Drop for CapabilityRegistry {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.try_lock() {
            if let Some((token, _)) = listener.take() {
                token.cancel();
            }
        }
    }
}

async fn listen(
    bus: Arc<dyn MessageBus>,
    directory: Arc<RwLock<Directory>>,
    config: RuntimeConfig,
    shutdown: CancellationToken,
) {
    let started_topic = event_topic(AGENT_STARTED);
    let stopped_topic = event_topic(AGENT_STOPPED);

    loop {
        let delay = match poll_once(bus.as_ref(), &directory, &started_topic, &stopped_topic).await {
            Ok(()) => config.poll_interval(),
            Err(e) => {
                warn!("Registry failed to poll lifecycle events: {}", e);
                config.error_backoff()
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Registry listener exited");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Started,
    Stopped,
}

/// Drain both lifecycle topics and apply the batch in timestamp order, so a
/// stop and a restart of the same agent within one poll resolve correctly
async fn poll_once(
    bus: &dyn MessageBus,
    directory: &RwLock<Directory>,
    started_topic: &str,
    stopped_topic: &str,
) -> Result<(), BusError> {
    let mut batch = Vec::new();
    for (topic, kind) in [(started_topic, Lifecycle::Started), (stopped_topic, Lifecycle::Stopped)] {
        for wire in bus.read(topic).await? {
            match envelope::decode(&wire) {
                Ok(event) => batch.push((kind, event)),
                Err(e) => warn!("Registry skipping undecodable lifecycle event on {}: {}", topic, e),
            }
        }
    }

    // Stable: ties keep per-topic order
    batch.sort_by_key(|(_, event)| event.timestamp);
    for (kind, event) in &batch {
        match kind {
            Lifecycle::Started => apply_started(directory, event).await,
            Lifecycle::Stopped => apply_stopped(directory, event).await,
        }
    }
    Ok(())
}

async fn apply_started(directory: &RwLock<Directory>, event: &Envelope) {
    let (Some(agent_id), Some(name)) = (event.payload_str("agent_id"), event.payload_str("name")) else {
        warn!("Registry ignoring start event {} without agent_id or name", event.id);
        return;
    };
    let agent_id = AgentId::from(agent_id);
    let capabilities = event.payload_strings("capabilities");

    let mut directory = directory.write().await;

    // A restart may advertise a different capability set
    if let Some(previous) = directory.agents.get(&agent_id).cloned() {
        directory.unindex(&agent_id, &previous.capabilities);
    }
    for capability in &capabilities {
        directory
            .capabilities
            .entry(capability.clone())
            .or_default()
            .insert(agent_id.clone());
    }

    info!("Registered agent {} ({}) with capabilities {:?}", name, agent_id, capabilities);
    directory.agents.insert(
        agent_id.clone(),
        RegistryEntry {
            agent_id,
            name: name.to_string(),
            capabilities,
            status: RegistrationStatus::Active,
        },
    );
}

async fn apply_stopped(directory: &RwLock<Directory>, event: &Envelope) {
    let Some(agent_id) = event.payload_str("agent_id") else {
        warn!("Registry ignoring stop event {} without agent_id", event.id);
        return;
    };
    let agent_id = AgentId::from(agent_id);

    let mut directory = directory.write().await;
    let Some(entry) = directory.agents.get_mut(&agent_id) else {
        warn!("Registry received stop for unknown agent {}", agent_id);
        return;
    };
    entry.status = RegistrationStatus::Inactive;
    let name = entry.name.clone();
    let capabilities = entry.capabilities.clone();
    directory.unindex(&agent_id, &capabilities);

    info!("Unregistered agent {} ({})", name, agent_id);
}
