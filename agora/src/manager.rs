//! Agent manager and factory
//!
//! [`AgentManager`] owns the capability registry and every agent it started.
//! [`AgentFactory`] turns configured [`AgentSpec`]s into generic agents.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::agent::{Agent, AgentBuilder, AgentError, AgentInfo};
use crate::bus::{BusError, BusFactory};
use crate::config::{AgentSpec, AgoraConfig};
use crate::dispatch::TeachingHandlers;
use crate::envelope::AgentId;
use crate::feedback::{FeedbackManager, InMemoryFeedbackRepository};
use crate::needs::StaticFulfillment;
use crate::registry::CapabilityRegistry;

/// Manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Agent already registered: {0}")]
    AlreadyRegistered(AgentId),

    #[error("Invalid agent spec: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

// ============================================================================
// Factory
// ============================================================================

/// Builds agents from configuration, each on its own bus client
#[derive(Clone)]
pub struct AgentFactory {
    buses: Arc<dyn BusFactory>,
    config: AgoraConfig,
    feedback: Option<Arc<FeedbackManager>>,
}

impl AgentFactory {
    pub fn new(buses: Arc<dyn BusFactory>, config: AgoraConfig) -> Self {
        Self {
            buses,
            config,
            feedback: None,
        }
    }

    /// Attach a shared feedback manager to every agent built
    pub fn with_feedback_manager(mut self, manager: Arc<FeedbackManager>) -> Self {
        self.feedback = Some(manager);
        self
    }

    /// Builder preloaded with the runtime and teaching settings
    pub fn builder(&self, name: impl Into<String>) -> AgentBuilder {
        let mut builder = AgentBuilder::new(name)
            .runtime_config(self.config.runtime.clone())
            .teaching_config(self.config.teaching.clone());
        if let Some(manager) = &self.feedback {
            builder = builder.feedback_manager(manager.clone());
        }
        builder
    }

    pub fn create_agent(&self, spec: &AgentSpec) -> Result<Agent> {
        if spec.name.trim().is_empty() {
            return Err(ManagerError::InvalidSpec("agent name must not be empty".to_string()));
        }

        let mut builder = self.builder(spec.name.clone()).capabilities(spec.capabilities.iter().cloned());
        if let Some(id) = spec.id.as_deref().filter(|id| !id.is_empty()) {
            builder = builder.id(id);
        }
        if spec.teaching {
            builder = builder.handlers(TeachingHandlers::new());
        }
        if let Some(data) = &spec.need_fulfillment {
            builder = builder.need_responder(Arc::new(StaticFulfillment::new(data.clone())));
        }

        let agent = builder.build(self.buses.client());
        info!("Created agent {} ({})", agent.name(), agent.id());
        Ok(agent)
    }

    /// Build every valid spec; invalid ones are logged and skipped
    pub fn create_agents(&self, specs: &[AgentSpec]) -> Vec<Agent> {
        specs
            .iter()
            .filter_map(|spec| match self.create_agent(spec) {
                Ok(agent) => Some(agent),
                Err(e) => {
                    error!("Skipping agent {:?}: {}", spec.name, e);
                    None
                }
            })
            .collect()
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct AgentManager {
    factory: AgentFactory,
    config: AgoraConfig,
    registry: CapabilityRegistry,
    feedback: Arc<FeedbackManager>,
    agents: RwLock<BTreeMap<AgentId, Arc<Agent>>>,
    running: AtomicBool,
}

impl AgentManager {
    pub fn new(buses: Arc<dyn BusFactory>, config: AgoraConfig) -> Self {
        let feedback = Arc::new(FeedbackManager::new(
            Arc::new(InMemoryFeedbackRepository::new()),
            config.feedback.clone(),
        ));
        let registry = CapabilityRegistry::new(buses.client(), config.runtime.clone());
        let factory = AgentFactory::new(buses, config.clone()).with_feedback_manager(feedback.clone());

        Self {
            factory,
            config,
            registry,
            feedback,
            agents: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn factory(&self) -> &AgentFactory {
        &self.factory
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn feedback_manager(&self) -> &Arc<FeedbackManager> {
        &self.feedback
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the registry, then every configured agent
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Starting agent manager");
        if let Err(e) = self.registry.start().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let agents = self.factory.create_agents(&self.config.agents);
        let mut started = 0;
        for agent in agents {
            match self.register_agent(agent).await {
                Ok(_) => started += 1,
                Err(e) => error!("Failed to start configured agent: {}", e),
            }
        }

        info!("Agent manager started with {} configured agents", started);
        Ok(())
    }

    /// Stop every agent concurrently, then the registry
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Stopping agent manager");
        let agents: Vec<Arc<Agent>> = {
            let mut agents = self.agents.write().await;
            std::mem::take(&mut *agents).into_values().collect()
        };

        let results = futures::future::join_all(agents.iter().map(|agent| agent.stop())).await;
        for (agent, result) in agents.iter().zip(results) {
            if let Err(e) = result {
                warn!("Agent {} did not stop cleanly: {}", agent.id(), e);
            }
        }

        self.registry.stop().await;
        info!("Agent manager stopped");
        Ok(())
    }

    /// Take ownership of an agent and start it
    pub async fn register_agent(&self, agent: Agent) -> Result<Arc<Agent>> {
        let agent = Arc::new(agent);
        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(agent.id()) {
                return Err(ManagerError::AlreadyRegistered(agent.id().clone()));
            }
            agents.insert(agent.id().clone(), agent.clone());
        }

        if let Err(e) = agent.start().await {
            self.agents.write().await.remove(agent.id());
            return Err(e.into());
        }

        info!("Registered and started agent {} ({})", agent.name(), agent.id());
        Ok(agent)
    }

    /// Stop and forget an agent. Returns false for unknown ids.
    pub async fn unregister_agent(&self, agent_id: &AgentId) -> Result<bool> {
        let Some(agent) = self.agents.write().await.remove(agent_id) else {
            warn!("Agent {} not found", agent_id);
            return Ok(false);
        };

        agent.stop().await?;
        info!("Unregistered and stopped agent {} ({})", agent.name(), agent_id);
        Ok(true)
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn get_all_agents(&self) -> Vec<Arc<Agent>> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn agent_infos(&self) -> Vec<AgentInfo> {
        self.agents.read().await.values().map(|agent| agent.info()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use crate::bus::MemoryBroker;
    use crate::config::RuntimeConfig;

    fn config(agents: Vec<AgentSpec>) -> AgoraConfig {
        AgoraConfig {
            runtime: RuntimeConfig {
                poll_interval_ms: 10,
                error_backoff_ms: 50,
                ..Default::default()
            },
            agents,
            ..Default::default()
        }
    }

    fn spec(id: Option<&str>, name: &str) -> AgentSpec {
        AgentSpec {
            id: id.map(String::from),
            name: name.to_string(),
            capabilities: vec!["storage".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_factory_generates_ids_and_rejects_empty_names() {
        let factory = AgentFactory::new(Arc::new(MemoryBroker::new()), config(vec![]));

        let agent = factory.create_agent(&spec(None, "worker")).unwrap();
        assert!(agent.id().as_str().starts_with("agent-"));
        assert_eq!(agent.id().as_str().len(), "agent-".len() + 8);

        let agent = factory.create_agent(&spec(Some("w1"), "worker")).unwrap();
        assert_eq!(agent.id().as_str(), "w1");

        assert!(matches!(
            factory.create_agent(&spec(None, "  ")),
            Err(ManagerError::InvalidSpec(_))
        ));
        assert_eq!(factory.create_agents(&[spec(None, ""), spec(None, "ok")]).len(), 1);
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let manager = AgentManager::new(
            Arc::new(MemoryBroker::new()),
            config(vec![spec(Some("w1"), "one"), spec(Some("w2"), "two")]),
        );
        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.get_all_agents().await.len(), 2);

        let w1 = manager.get_agent(&AgentId::from("w1")).await.unwrap();
        assert_eq!(w1.state(), AgentState::Idle);

        assert!(manager.unregister_agent(&AgentId::from("w1")).await.unwrap());
        assert!(!manager.unregister_agent(&AgentId::from("w1")).await.unwrap());
        assert_eq!(w1.state(), AgentState::Stopped);

        let w2 = manager.get_agent(&AgentId::from("w2")).await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(w2.state(), AgentState::Stopped);
        assert!(manager.get_all_agents().await.is_empty());
        assert!(!manager.registry().is_running().await);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let manager = AgentManager::new(Arc::new(MemoryBroker::new()), config(vec![]));
        manager.start().await.unwrap();

        let first = manager.factory().create_agent(&spec(Some("dup"), "one")).unwrap();
        let second = manager.factory().create_agent(&spec(Some("dup"), "two")).unwrap();
        manager.register_agent(first).await.unwrap();
        assert!(matches!(
            manager.register_agent(second).await,
            Err(ManagerError::AlreadyRegistered(_))
        ));

        manager.stop().await.unwrap();
    }
}
