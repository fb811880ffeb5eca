//! Smart load balancing: algorithm selection, session affinity and circuit
//! breaking in front of the instance pool.

pub mod affinity;
pub mod circuit;
pub mod ring;

pub use affinity::{AffinityMap, AffinitySource};
pub use circuit::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use ring::{HashRing, DEFAULT_VIRTUAL_NODES};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{OrchestratorError, Result};
use crate::pool::{AgentInstance, InstancePool, InstanceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    WeightedLeastConnections,
    FastestResponse,
    ResourceBased,
    AdaptiveRandom,
    ConsistentHash,
    Predictive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalanceConfig {
    pub algorithm: LoadBalanceAlgorithm,
    pub session_affinity: AffinitySource,
    pub sticky_session_timeout: Duration,
    pub failover_retries: usize,
    pub circuit_breaker_enabled: bool,
    pub adaptive_weights: bool,
    pub health_check_weight: f64,
    pub response_time_weight: f64,
    pub load_weight: f64,
    pub learning_rate: f64,
    pub virtual_nodes: usize,
    pub max_round_robin_counter_per_agent: u64,
}

impl Default for LoadBalanceConfig {
    fn default() -> Self {
        Self {
            algorithm: LoadBalanceAlgorithm::WeightedLeastConnections,
            session_affinity: AffinitySource::SessionId,
            sticky_session_timeout: Duration::from_secs(3600),
            failover_retries: 3,
            circuit_breaker_enabled: true,
            adaptive_weights: true,
            health_check_weight: 0.4,
            response_time_weight: 0.3,
            load_weight: 0.3,
            learning_rate: 0.01,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            max_round_robin_counter_per_agent: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingRequest {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
    pub headers: HashMap<String, String>,
    pub request_type: String,
}

impl RoutingRequest {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            request_type: "chat".into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct RoutingDecision {
    pub instance: Arc<AgentInstance>,
    pub affinity_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub routed_per_instance: HashMap<String, u64>,
    pub affinity_entries: usize,
    pub breaker_states: HashMap<String, BreakerState>,
}

pub struct SmartLoadBalancer {
    config: LoadBalanceConfig,
    breaker_config: CircuitBreakerConfig,
    pool: Arc<InstancePool>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    affinity: AffinityMap,
    round_robin: Mutex<HashMap<String, u64>>,
    ring: Mutex<HashRing>,
    prediction_weights: Mutex<HashMap<String, f64>>,
    routed: Mutex<HashMap<String, u64>>,
}

impl SmartLoadBalancer {
    pub fn new(
        config: LoadBalanceConfig,
        breaker_config: CircuitBreakerConfig,
        pool: Arc<InstancePool>,
    ) -> Self {
        let affinity = AffinityMap::new(config.sticky_session_timeout);
        let ring = HashRing::new(config.virtual_nodes);
        Self {
            config,
            breaker_config,
            pool,
            breakers: Mutex::new(HashMap::new()),
            affinity,
            round_robin: Mutex::new(HashMap::new()),
            ring: Mutex::new(ring),
            prediction_weights: Mutex::new(HashMap::new()),
            routed: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LoadBalanceConfig {
        &self.config
    }

    pub async fn route(&self, request: &RoutingRequest) -> Result<RoutingDecision> {
        self.route_excluding(request, &HashSet::new()).await
    }

    /// Route a request, skipping explicitly excluded instances (used by the
    /// failover retry loop).
    pub async fn route_excluding(
        &self,
        request: &RoutingRequest,
        exclude: &HashSet<String>,
    ) -> Result<RoutingDecision> {
        let mut candidates: Vec<Arc<AgentInstance>> = self
            .pool
            .candidates(&request.agent_id)
            .await
            .into_iter()
            .filter(|i| !exclude.contains(&i.instance_id))
            .collect();

        if self.config.circuit_breaker_enabled {
            let breakers = self.breakers.lock().await;
            candidates.retain(|i| {
                breakers
                    .get(&i.instance_id)
                    .map(CircuitBreaker::can_route)
                    .unwrap_or(true)
            });
        }

        if candidates.is_empty() {
            // Create on demand when there is headroom; a populated fleet
            // that is entirely tripped or excluded is an upstream failure.
            match self.pool.create(&request.agent_id).await {
                Ok(instance) if !exclude.contains(&instance.instance_id) => {
                    candidates.push(instance)
                }
                Ok(_) | Err(OrchestratorError::NoCapacity(_)) => {
                    let fleet = self.pool.instances_for(&request.agent_id).await;
                    if fleet.is_empty() {
                        return Err(OrchestratorError::NoCapacity(request.agent_id.clone()));
                    }
                    return Err(OrchestratorError::UpstreamFailure(format!(
                        "no routable instance for agent '{}'",
                        request.agent_id
                    )));
                }
                Err(err) => return Err(err),
            }
        }

        // Session affinity: an existing fresh binding that is still in the
        // candidate set wins over the algorithm.
        let affinity_key = self.affinity_key(request);
        if let Some(key) = &affinity_key {
            if let Some(bound) = self.affinity.get(key) {
                if let Some(instance) = candidates.iter().find(|i| i.instance_id == bound) {
                    let instance = Arc::clone(instance);
                    self.commit(&instance).await;
                    return Ok(RoutingDecision {
                        instance,
                        affinity_hit: true,
                    });
                }
            }
        }

        let mut snapshots = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            snapshots.push(candidate.snapshot().await);
        }
        let index = self.select_index(request, &snapshots).await;
        let instance = Arc::clone(&candidates[index]);

        if let Some(key) = &affinity_key {
            self.affinity.bind(key, &instance.instance_id);
        }
        self.commit(&instance).await;
        Ok(RoutingDecision {
            instance,
            affinity_hit: false,
        })
    }

    async fn commit(&self, instance: &Arc<AgentInstance>) {
        if self.config.circuit_breaker_enabled {
            let mut breakers = self.breakers.lock().await;
            breakers
                .entry(instance.instance_id.clone())
                .or_insert_with(|| CircuitBreaker::new(self.breaker_config))
                .note_dispatch();
        }
        *self
            .routed
            .lock()
            .await
            .entry(instance.instance_id.clone())
            .or_default() += 1;
    }

    fn affinity_key(&self, request: &RoutingRequest) -> Option<String> {
        match &self.config.session_affinity {
            AffinitySource::Disabled => None,
            AffinitySource::SessionId => request.session_id.clone(),
            AffinitySource::UserId => request.user_id.clone(),
            AffinitySource::ClientIp => request.client_ip.clone(),
            AffinitySource::Header(name) => request.headers.get(name).cloned(),
        }
    }

    async fn select_index(&self, request: &RoutingRequest, snapshots: &[InstanceSnapshot]) -> usize {
        debug_assert!(!snapshots.is_empty());
        if snapshots.len() == 1 {
            return 0;
        }
        match self.config.algorithm {
            LoadBalanceAlgorithm::RoundRobin => {
                let counter = self.bump_round_robin(&request.agent_id).await;
                (counter % snapshots.len() as u64) as usize
            }
            LoadBalanceAlgorithm::WeightedRoundRobin => {
                let mut expanded = Vec::new();
                for (index, snapshot) in snapshots.iter().enumerate() {
                    let copies = (snapshot.weight * 10.0).ceil().max(1.0) as usize;
                    expanded.extend(std::iter::repeat(index).take(copies));
                }
                let counter = self.bump_round_robin(&request.agent_id).await;
                expanded[(counter % expanded.len() as u64) as usize]
            }
            LoadBalanceAlgorithm::LeastConnections => {
                min_index_by(snapshots, |s| s.active_sessions as f64)
            }
            LoadBalanceAlgorithm::WeightedLeastConnections => min_index_by(snapshots, |s| {
                s.active_sessions as f64 / s.weight.max(0.1)
            }),
            LoadBalanceAlgorithm::FastestResponse => {
                min_index_by(snapshots, |s| s.avg_response_time)
            }
            LoadBalanceAlgorithm::ResourceBased => {
                let config = &self.config;
                max_index_by(snapshots, |s| {
                    let health = s.health_score / 100.0;
                    let load_slack = 1.0 - s.session_load();
                    let response = 1.0 / s.avg_response_time.max(1.0);
                    health * config.health_check_weight
                        + load_slack * config.load_weight
                        + response * config.response_time_weight
                })
            }
            LoadBalanceAlgorithm::AdaptiveRandom => {
                let weights: Vec<f64> = snapshots
                    .iter()
                    .map(|s| {
                        let health = s.health_score / 100.0;
                        let load_slack = 1.0 - s.session_load();
                        ((health + load_slack) * s.weight).max(0.1)
                    })
                    .collect();
                let total: f64 = weights.iter().sum();
                let mut roll = rand::thread_rng().gen_range(0.0..total);
                for (index, weight) in weights.iter().enumerate() {
                    roll -= weight;
                    if roll <= 0.0 {
                        return index;
                    }
                }
                snapshots.len() - 1
            }
            LoadBalanceAlgorithm::ConsistentHash => {
                let key = request
                    .session_id
                    .clone()
                    .or_else(|| request.user_id.clone())
                    .or_else(|| request.client_ip.clone())
                    .unwrap_or_else(|| "default".to_string());
                let ids: Vec<String> = snapshots.iter().map(|s| s.instance_id.clone()).collect();
                let mut ring = self.ring.lock().await;
                ring.update(&ids);
                let located = ring.locate(&key).map(str::to_string);
                located
                    .and_then(|id| snapshots.iter().position(|s| s.instance_id == id))
                    .unwrap_or(0)
            }
            LoadBalanceAlgorithm::Predictive => {
                let weights = self.prediction_weights.lock().await;
                max_index_by(snapshots, |s| {
                    let learned = weights
                        .get(&prediction_key(&s.instance_id, &request.request_type))
                        .copied()
                        .unwrap_or(1.0);
                    let health = s.health_score / 100.0;
                    let load_slack = 1.0 - s.session_load();
                    let response = 1.0 / s.avg_response_time.max(1.0);
                    0.3 * health + 0.3 * load_slack + 0.3 * response + 0.1 * learned
                })
            }
        }
    }

    async fn bump_round_robin(&self, agent_id: &str) -> u64 {
        let mut counters = self.round_robin.lock().await;
        let counter = counters.entry(agent_id.to_string()).or_insert(0);
        let current = *counter;
        *counter = (current + 1) % self.config.max_round_robin_counter_per_agent;
        current
    }

    /// Fold one request outcome into the breaker and the learned weights.
    pub async fn record_outcome(
        &self,
        instance_id: &str,
        request_type: &str,
        latency_ms: f64,
        success: bool,
    ) {
        if self.config.circuit_breaker_enabled {
            let mut breakers = self.breakers.lock().await;
            let breaker = breakers
                .entry(instance_id.to_string())
                .or_insert_with(|| CircuitBreaker::new(self.breaker_config));
            if success {
                breaker.on_success();
            } else {
                breaker.on_failure();
            }
        }

        if self.config.adaptive_weights {
            let reward = if success {
                1.0 / latency_ms.max(1.0)
            } else {
                -1.0
            };
            let mut weights = self.prediction_weights.lock().await;
            let weight = weights
                .entry(prediction_key(instance_id, request_type))
                .or_insert(1.0);
            *weight = (*weight + self.config.learning_rate * reward).clamp(0.1, 2.0);
        }
    }

    pub async fn breaker_state(&self, instance_id: &str) -> Option<BreakerState> {
        self.breakers
            .lock()
            .await
            .get(instance_id)
            .map(CircuitBreaker::state)
    }

    /// Drop all routing state held for a removed instance.
    pub async fn forget_instance(&self, instance_id: &str) {
        self.breakers.lock().await.remove(instance_id);
        self.affinity.forget_instance(instance_id);
        self.routed.lock().await.remove(instance_id);
        self.prediction_weights
            .lock()
            .await
            .retain(|key, _| !key.starts_with(&format!("{instance_id}:")));
    }

    pub async fn stats(&self) -> BalancerStats {
        let breakers = self.breakers.lock().await;
        BalancerStats {
            routed_per_instance: self.routed.lock().await.clone(),
            affinity_entries: self.affinity.len(),
            breaker_states: breakers
                .iter()
                .map(|(id, b)| (id.clone(), b.state()))
                .collect(),
        }
    }

    /// Background upkeep: learned-weight decay every five minutes, affinity
    /// sweep every hour.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let decay = {
            let balancer = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(300));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let mut weights = balancer.prediction_weights.lock().await;
                    for weight in weights.values_mut() {
                        *weight *= 0.99;
                    }
                }
            })
        };
        let sweep = {
            let balancer = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(3600));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    balancer.affinity.sweep();
                }
            })
        };
        vec![decay, sweep]
    }
}

fn prediction_key(instance_id: &str, request_type: &str) -> String {
    format!("{instance_id}:{request_type}")
}

fn min_index_by<F: Fn(&InstanceSnapshot) -> f64>(snapshots: &[InstanceSnapshot], score: F) -> usize {
    let mut best = 0;
    for index in 1..snapshots.len() {
        if score(&snapshots[index]) < score(&snapshots[best]) {
            best = index;
        }
    }
    best
}

fn max_index_by<F: Fn(&InstanceSnapshot) -> f64>(snapshots: &[InstanceSnapshot], score: F) -> usize {
    let mut best = 0;
    for index in 1..snapshots.len() {
        if score(&snapshots[index]) > score(&snapshots[best]) {
            best = index;
        }
    }
    best
}
