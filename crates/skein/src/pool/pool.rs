//! Instance pool: per-agent instance lists, on-demand creation up to the
//! configured ceiling, and the idle reaper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::instance::{AgentInstance, InstanceSnapshot, InstanceStatus};
use crate::dag::{GeneratedDag, UserPreferences};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventSink, OrchestratorEvent};
use crate::worker::{WorkerConfig, WorkerRuntime};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_instances_per_agent: usize,
    pub max_instances_per_agent: usize,
    pub instance_timeout: Duration,
    pub default_max_concurrent_sessions: u32,
    pub default_weight: f64,
    pub reaper_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances_per_agent: 1,
            max_instances_per_agent: 5,
            instance_timeout: Duration::from_secs(300),
            default_max_concurrent_sessions: 50,
            default_weight: 1.0,
            reaper_interval: Duration::from_secs(60),
        }
    }
}

/// Everything the pool needs to mint another instance of an agent.
#[derive(Clone)]
pub struct AgentBlueprint {
    pub agent_id: String,
    pub dag: Arc<GeneratedDag>,
    pub worker_config: WorkerConfig,
    pub preferences: UserPreferences,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleOutcome {
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_instances: usize,
    pub idle_instances: usize,
    pub busy_instances: usize,
    pub unhealthy_instances: usize,
    pub instances_per_agent: HashMap<String, usize>,
}

pub struct InstancePool {
    config: PoolConfig,
    worker: Arc<dyn WorkerRuntime>,
    events: Arc<dyn EventSink>,
    instances: RwLock<HashMap<String, Arc<AgentInstance>>>,
    by_agent: RwLock<HashMap<String, Vec<String>>>,
    blueprints: RwLock<HashMap<String, AgentBlueprint>>,
}

impl InstancePool {
    pub fn new(
        config: PoolConfig,
        worker: Arc<dyn WorkerRuntime>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            worker,
            events,
            instances: RwLock::new(HashMap::new()),
            by_agent: RwLock::new(HashMap::new()),
            blueprints: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register the compiled shape of an agent; `create` uses it from here
    /// on.
    pub async fn register_blueprint(&self, blueprint: AgentBlueprint) {
        self.blueprints
            .write()
            .await
            .insert(blueprint.agent_id.clone(), blueprint);
    }

    pub async fn blueprint(&self, agent_id: &str) -> Option<AgentBlueprint> {
        self.blueprints.read().await.get(agent_id).cloned()
    }

    pub async fn get(&self, instance_id: &str) -> Option<Arc<AgentInstance>> {
        self.instances.read().await.get(instance_id).cloned()
    }

    pub async fn all_instances(&self) -> Vec<Arc<AgentInstance>> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn instances_for(&self, agent_id: &str) -> Vec<Arc<AgentInstance>> {
        let by_agent = self.by_agent.read().await;
        let instances = self.instances.read().await;
        by_agent
            .get(agent_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| instances.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Instances the balancer may route to right now, ordered by id for
    /// deterministic tie-breaks.
    pub async fn candidates(&self, agent_id: &str) -> Vec<Arc<AgentInstance>> {
        let mut available: Vec<Arc<AgentInstance>> = self
            .instances_for(agent_id)
            .await
            .into_iter()
            .filter(|i| i.is_available())
            .collect();
        available.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        available
    }

    /// Create one more instance for an agent, activate it with a probe call,
    /// and register it.
    pub async fn create(&self, agent_id: &str) -> Result<Arc<AgentInstance>> {
        let blueprint = self
            .blueprint(agent_id)
            .await
            .ok_or_else(|| OrchestratorError::InstanceNotFound(agent_id.to_string()))?;

        {
            let by_agent = self.by_agent.read().await;
            let current = by_agent.get(agent_id).map(Vec::len).unwrap_or(0);
            if current >= self.config.max_instances_per_agent {
                return Err(OrchestratorError::NoCapacity(agent_id.to_string()));
            }
        }

        let handle = self.worker.create(blueprint.worker_config.clone()).await?;
        if let Err(err) = self.worker.ping(&handle).await {
            let _ = self.worker.destroy(&handle).await;
            return Err(OrchestratorError::UpstreamFailure(format!(
                "activation probe failed: {err}"
            )));
        }

        let instance = Arc::new(AgentInstance::new(
            format!("inst_{}", Uuid::new_v4().simple()),
            agent_id,
            handle,
            Arc::clone(&blueprint.dag),
            self.config.default_max_concurrent_sessions,
            self.config.default_weight,
        ));
        instance.set_status(InstanceStatus::Idle);

        self.instances
            .write()
            .await
            .insert(instance.instance_id.clone(), Arc::clone(&instance));
        self.by_agent
            .write()
            .await
            .entry(agent_id.to_string())
            .or_default()
            .push(instance.instance_id.clone());

        self.events.emit(OrchestratorEvent::InstanceCreated {
            instance_id: instance.instance_id.clone(),
            agent_id: agent_id.to_string(),
        });
        tracing::info!(instance = %instance.instance_id, agent = %agent_id, "instance created");
        Ok(instance)
    }

    /// Pick an instance with a free session slot, creating one on demand
    /// when every existing instance is busy or absent.
    pub async fn acquire(&self, agent_id: &str) -> Result<Arc<AgentInstance>> {
        let mut candidates = self.candidates(agent_id).await;
        candidates.sort_by_key(|i| i.active_sessions());
        for instance in candidates {
            if instance.try_acquire_session() {
                return Ok(instance);
            }
        }

        let created = self.create(agent_id).await?;
        if created.try_acquire_session() {
            Ok(created)
        } else {
            Err(OrchestratorError::NoCapacity(agent_id.to_string()))
        }
    }

    /// Return a session and fold the request's metrics into the instance.
    pub async fn release(&self, instance_id: &str, latency_ms: f64, success: bool) -> Result<()> {
        let instance = self
            .get(instance_id)
            .await
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.to_string()))?;
        instance.release_session();
        instance.record_request(latency_ms, success).await;
        self.events.emit(OrchestratorEvent::InstanceUpdated {
            instance_id: instance_id.to_string(),
            agent_id: instance.agent_id.clone(),
        });
        Ok(())
    }

    /// Remove an instance and release its worker binding. Idempotent.
    pub async fn remove(&self, instance_id: &str) {
        let removed = self.instances.write().await.remove(instance_id);
        let Some(instance) = removed else {
            return;
        };
        if let Some(ids) = self.by_agent.write().await.get_mut(&instance.agent_id) {
            ids.retain(|id| id != instance_id);
        }
        instance.set_status(InstanceStatus::Offline);
        if let Err(err) = self.worker.destroy(&instance.worker).await {
            tracing::debug!(instance = %instance_id, error = %err, "worker destroy failed");
        }
        self.events.emit(OrchestratorEvent::InstanceDeleted {
            instance_id: instance_id.to_string(),
            agent_id: instance.agent_id.clone(),
        });
        tracing::info!(instance = %instance_id, "instance removed");
    }

    /// Grow or shrink an agent to `target` instances. Shrinking prefers
    /// instances with no active sessions and the lowest health score.
    pub async fn scale(&self, agent_id: &str, target: usize) -> Result<ScaleOutcome> {
        let target = target.min(self.config.max_instances_per_agent);
        let current = self.instances_for(agent_id).await;

        if target > current.len() {
            let mut added = 0;
            for _ in current.len()..target {
                match self.create(agent_id).await {
                    Ok(_) => added += 1,
                    Err(err) => {
                        tracing::warn!(agent = %agent_id, error = %err, "scale-up stopped early");
                        break;
                    }
                }
            }
            return Ok(ScaleOutcome { added, removed: 0 });
        }

        let mut victims: Vec<(u32, u32, String)> = Vec::new();
        for instance in &current {
            victims.push((
                instance.active_sessions(),
                (instance.health_score() * 10.0) as u32,
                instance.instance_id.clone(),
            ));
        }
        // Idle first, then weakest health.
        victims.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut removed = 0;
        for (_, _, instance_id) in victims.into_iter().take(current.len() - target) {
            self.remove(&instance_id).await;
            removed += 1;
        }
        Ok(ScaleOutcome { added: 0, removed })
    }

    /// Drop instances idle past the timeout, keeping the per-agent floor.
    pub async fn reap_idle(&self) {
        let timeout_ms = self.config.instance_timeout.as_millis() as u64;
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let all = self.all_instances().await;
        for instance in all {
            if instance.active_sessions() > 0 {
                continue;
            }
            if now_ms.saturating_sub(instance.last_activity_ms()) < timeout_ms {
                continue;
            }
            let siblings = self.instances_for(&instance.agent_id).await.len();
            if siblings <= self.config.min_instances_per_agent {
                continue;
            }
            tracing::info!(instance = %instance.instance_id, "reaping idle instance");
            self.remove(&instance.instance_id).await;
        }
    }

    pub async fn snapshots(&self) -> Vec<InstanceSnapshot> {
        let instances = self.all_instances().await;
        let mut snapshots = Vec::with_capacity(instances.len());
        for instance in instances {
            snapshots.push(instance.snapshot().await);
        }
        snapshots
    }

    pub async fn status(&self) -> PoolStatus {
        let instances = self.all_instances().await;
        let mut status = PoolStatus {
            total_instances: instances.len(),
            idle_instances: 0,
            busy_instances: 0,
            unhealthy_instances: 0,
            instances_per_agent: HashMap::new(),
        };
        for instance in &instances {
            match instance.status() {
                InstanceStatus::Idle => status.idle_instances += 1,
                InstanceStatus::Busy | InstanceStatus::Overloaded => status.busy_instances += 1,
                InstanceStatus::Unhealthy => status.unhealthy_instances += 1,
                _ => {}
            }
            *status
                .instances_per_agent
                .entry(instance.agent_id.clone())
                .or_default() += 1;
        }
        status
    }

    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = pool.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.reap_idle().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{GenerationMode, GeneratedDag, UserPreferences};
    use crate::events::NullSink;
    use crate::worker::{default_worker_config, InMemoryWorker};
    use chrono::Utc;

    fn empty_dag() -> Arc<GeneratedDag> {
        Arc::new(GeneratedDag {
            dag_id: "d1".into(),
            template_id: "t1".into(),
            user_id: "u1".into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            execution_order: Vec::new(),
            selected_tools: Vec::new(),
            tool_mapping: HashMap::new(),
            mode: GenerationMode::Custom,
            optimization_score: 0.0,
            estimated_cost: 0.0,
            estimated_time: 0.0,
            created_at: Utc::now(),
        })
    }

    async fn pool_with_agent(config: PoolConfig) -> Arc<InstancePool> {
        let pool = Arc::new(InstancePool::new(
            config,
            Arc::new(InMemoryWorker::new()),
            Arc::new(NullSink),
        ));
        pool.register_blueprint(AgentBlueprint {
            agent_id: "a1".into(),
            dag: empty_dag(),
            worker_config: default_worker_config("a1"),
            preferences: UserPreferences::default(),
        })
        .await;
        pool
    }

    #[tokio::test]
    async fn test_create_activates_and_registers() {
        let pool = pool_with_agent(PoolConfig::default()).await;
        let instance = pool.create("a1").await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Idle);
        assert_eq!(pool.instances_for("a1").await.len(), 1);
        assert!(pool.get(&instance.instance_id).await.is_some());
    }

    #[tokio::test]
    async fn test_create_without_blueprint_fails() {
        let pool = pool_with_agent(PoolConfig::default()).await;
        assert!(matches!(
            pool.create("ghost").await,
            Err(OrchestratorError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_ceiling() {
        let config = PoolConfig {
            max_instances_per_agent: 2,
            ..PoolConfig::default()
        };
        let pool = pool_with_agent(config).await;
        pool.create("a1").await.unwrap();
        pool.create("a1").await.unwrap();
        assert!(matches!(
            pool.create("a1").await,
            Err(OrchestratorError::NoCapacity(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_creates_on_demand_then_reuses() {
        let pool = pool_with_agent(PoolConfig::default()).await;
        let first = pool.acquire("a1").await.unwrap();
        assert_eq!(first.active_sessions(), 1);

        // A second acquire lands on the same instance; it has free slots.
        let second = pool.acquire("a1").await.unwrap();
        assert_eq!(second.instance_id, first.instance_id);
        assert_eq!(first.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_acquire_release_round_trip() {
        let pool = pool_with_agent(PoolConfig::default()).await;
        let instance = pool.acquire("a1").await.unwrap();
        let before = instance.active_sessions();

        pool.release(&instance.instance_id, 120.0, true)
            .await
            .unwrap();
        assert_eq!(instance.active_sessions(), before - 1);
        let snapshot = instance.snapshot().await;
        assert_eq!(snapshot.total_requests, 1);
    }

    #[tokio::test]
    async fn test_saturated_instances_spill_to_new_one() {
        let config = PoolConfig {
            default_max_concurrent_sessions: 1,
            ..PoolConfig::default()
        };
        let pool = pool_with_agent(config).await;
        let first = pool.acquire("a1").await.unwrap();
        let second = pool.acquire("a1").await.unwrap();
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(pool.instances_for("a1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let pool = pool_with_agent(PoolConfig::default()).await;
        let instance = pool.create("a1").await.unwrap();
        pool.remove(&instance.instance_id).await;
        pool.remove(&instance.instance_id).await;
        assert!(pool.instances_for("a1").await.is_empty());
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let pool = pool_with_agent(PoolConfig::default()).await;
        let outcome = pool.scale("a1", 3).await.unwrap();
        assert_eq!(outcome.added, 3);
        assert_eq!(pool.instances_for("a1").await.len(), 3);

        let outcome = pool.scale("a1", 1).await.unwrap();
        assert_eq!(outcome.removed, 2);
        assert_eq!(pool.instances_for("a1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_scale_down_prefers_idle_instances() {
        let pool = pool_with_agent(PoolConfig::default()).await;
        pool.scale("a1", 2).await.unwrap();

        let busy = pool.acquire("a1").await.unwrap();
        pool.scale("a1", 1).await.unwrap();

        let remaining = pool.instances_for("a1").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].instance_id, busy.instance_id);
    }

    #[tokio::test]
    async fn test_scale_clamps_to_max() {
        let config = PoolConfig {
            max_instances_per_agent: 2,
            ..PoolConfig::default()
        };
        let pool = pool_with_agent(config).await;
        let outcome = pool.scale("a1", 10).await.unwrap();
        assert_eq!(outcome.added, 2);
    }

    #[tokio::test]
    async fn test_reaper_keeps_agent_floor() {
        let config = PoolConfig {
            instance_timeout: Duration::from_millis(0),
            min_instances_per_agent: 1,
            ..PoolConfig::default()
        };
        let pool = pool_with_agent(config).await;
        pool.scale("a1", 3).await.unwrap();

        pool.reap_idle().await;
        assert_eq!(pool.instances_for("a1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_status_counts() {
        let pool = pool_with_agent(PoolConfig::default()).await;
        pool.scale("a1", 2).await.unwrap();
        pool.acquire("a1").await.unwrap();

        let status = pool.status().await;
        assert_eq!(status.total_instances, 2);
        assert_eq!(status.busy_instances, 1);
        assert_eq!(status.idle_instances, 1);
        assert_eq!(status.instances_per_agent["a1"], 2);
    }
}
