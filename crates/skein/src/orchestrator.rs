//! The orchestrator façade: wires every component together by explicit
//! construction and exposes the three public operations - create an agent,
//! execute a request against it, and scale its fleet.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balance::{RoutingRequest, SmartLoadBalancer};
use crate::config::OrchestratorConfig;
use crate::dag::{DagExecutor, DagGenerator, GenerationRequest, NodeId, TemplateStore};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventSink, NullSink};
use crate::health::HealthMonitor;
use crate::pool::{AgentBlueprint, InstancePool, ScaleOutcome};
use crate::scale::Autoscaler;
use crate::storage::{
    AgentSection, ConfigStore, DagSection, InstanceDocument, MemoryStore, MetaSection,
    ToolsSection,
};
use crate::tools::{
    GatewayRegistration, ServiceDirectory, ServiceEndpoints, ToolExecution, ToolExecutor,
    ToolRegistry,
};
use crate::worker::{WorkerConfig, WorkerRuntime};

/// What a caller gets back from `create_agent`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub instance_id: String,
    pub dag_id: String,
    pub template_id: String,
    pub optimization_score: f64,
    pub estimated_cost: f64,
    pub estimated_time: f64,
    pub status: String,
    pub health_status: String,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub agent_id: String,
    pub input: Value,
    pub user_id: String,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    pub headers: HashMap<String, String>,
    pub request_type: String,
}

impl ExecuteRequest {
    pub fn new(agent_id: impl Into<String>, input: Value, user_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            input,
            user_id: user_id.into(),
            session_id: None,
            client_ip: None,
            headers: HashMap::new(),
            request_type: "chat".into(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub instance_id: String,
    pub final_result: Option<Value>,
    pub execution_path: Vec<NodeId>,
    pub fallback_used: bool,
    pub latency: Duration,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    worker: Arc<dyn WorkerRuntime>,
    store: Arc<dyn ConfigStore>,
    registry: Arc<ToolRegistry>,
    templates: Arc<TemplateStore>,
    directory: Option<Arc<ServiceDirectory>>,
    generator: DagGenerator,
    executor: DagExecutor,
    tool_executor: ToolExecutor,
    pool: Arc<InstancePool>,
    monitor: Arc<HealthMonitor>,
    balancer: Arc<SmartLoadBalancer>,
    autoscaler: Arc<Autoscaler>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Construct the full component graph. No background loops run until
    /// [`Orchestrator::start`].
    pub async fn new(
        config: OrchestratorConfig,
        worker: Arc<dyn WorkerRuntime>,
        store: Arc<dyn ConfigStore>,
        events: Arc<dyn EventSink>,
        services: Vec<ServiceEndpoints>,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::with_builtins().await);
        let templates = Arc::new(TemplateStore::new());
        let directory = if services.is_empty() {
            None
        } else {
            Some(Arc::new(ServiceDirectory::new(
                services,
                Arc::clone(&registry),
            )))
        };

        let generator = DagGenerator::new(
            Arc::clone(&templates),
            Arc::clone(&registry),
            config.score_weights,
        );
        let executor = DagExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&worker),
            Arc::clone(&events),
        );
        let tool_executor = ToolExecutor::new(Arc::clone(&registry), directory.clone());
        let pool = Arc::new(InstancePool::new(
            config.pool.clone(),
            Arc::clone(&worker),
            Arc::clone(&events),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            config.monitor.clone(),
            Arc::clone(&pool),
            Arc::clone(&worker),
            Arc::clone(&events),
        ));
        let balancer = Arc::new(SmartLoadBalancer::new(
            config.load_balance.clone(),
            config.circuit_breaker,
            Arc::clone(&pool),
        ));
        let autoscaler = Arc::new(Autoscaler::new(
            config.autoscaler.clone(),
            Arc::clone(&pool),
            Arc::clone(&events),
        ));

        Self {
            config,
            worker,
            store,
            registry,
            templates,
            directory,
            generator,
            executor,
            tool_executor,
            pool,
            monitor,
            balancer,
            autoscaler,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Test-friendly construction: in-memory store, no events, no remote
    /// tool services.
    pub async fn with_defaults(worker: Arc<dyn WorkerRuntime>) -> Self {
        Self::new(
            OrchestratorConfig::default(),
            worker,
            Arc::new(MemoryStore::new()),
            Arc::new(NullSink),
            Vec::new(),
        )
        .await
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn balancer(&self) -> &Arc<SmartLoadBalancer> {
        &self.balancer
    }

    pub fn autoscaler(&self) -> &Arc<Autoscaler> {
        &self.autoscaler
    }

    /// Generate a DAG from the request, bind it to a pooled instance, attach
    /// the default scaling rule, and persist the instance document.
    pub async fn create_agent(&self, request: GenerationRequest) -> Result<AgentDescriptor> {
        let dag = Arc::new(self.generator.generate(&request).await?);
        let agent_id = format!("agent_{}", uuid::Uuid::new_v4().simple());

        let worker_config = match dag.primary_agent().and_then(|n| n.agent_config()) {
            Some(config) => WorkerConfig {
                name: config.agent_name.clone(),
                instructions: config.instructions.clone(),
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                tool_schemas: Vec::new(),
                knowledge_bases: config.knowledge_bases.clone(),
            },
            None => crate::worker::default_worker_config(&agent_id),
        };

        self.pool
            .register_blueprint(AgentBlueprint {
                agent_id: agent_id.clone(),
                dag: Arc::clone(&dag),
                worker_config,
                preferences: request.preferences.clone(),
            })
            .await;
        let instance = self.pool.create(&agent_id).await?;

        let rule = self.autoscaler.default_rule(&agent_id);
        self.autoscaler.add_rule(rule).await?;

        let document = self.build_document(&agent_id, &instance.instance_id, &dag, &request);
        self.store.save(&document).await?;

        tracing::info!(
            agent = %agent_id,
            instance = %instance.instance_id,
            dag = %dag.dag_id,
            "agent created"
        );
        Ok(AgentDescriptor {
            agent_id,
            instance_id: instance.instance_id.clone(),
            dag_id: dag.dag_id.clone(),
            template_id: dag.template_id.clone(),
            optimization_score: dag.optimization_score,
            estimated_cost: dag.estimated_cost,
            estimated_time: dag.estimated_time,
            status: instance.status().to_string(),
            health_status: instance.health_state().to_string(),
        })
    }

    /// Route a request to an instance and run the agent's DAG on it, failing
    /// over to other instances up to the configured retry limit.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        let blueprint = self
            .pool
            .blueprint(&request.agent_id)
            .await
            .ok_or_else(|| OrchestratorError::InstanceNotFound(request.agent_id.clone()))?;
        let deadline = blueprint.preferences.max_execution_time;

        let routing = RoutingRequest {
            agent_id: request.agent_id.clone(),
            session_id: request.session_id.clone(),
            user_id: Some(request.user_id.clone()),
            client_ip: request.client_ip.clone(),
            headers: request.headers.clone(),
            request_type: request.request_type.clone(),
        };

        let attempts = self.balancer.config().failover_retries + 1;
        let mut exclude: HashSet<String> = HashSet::new();

        for attempt in 0..attempts {
            let decision = match self.balancer.route_excluding(&routing, &exclude).await {
                Ok(decision) => decision,
                Err(err) if attempt > 0 => {
                    // Retries exhausted the candidate set.
                    tracing::warn!(agent = %request.agent_id, error = %err, "failover exhausted");
                    return Err(OrchestratorError::UpstreamFailure(format!(
                        "all failover candidates failed for agent '{}'",
                        request.agent_id
                    )));
                }
                Err(err) => return Err(err),
            };

            let instance = decision.instance;
            if !instance.try_acquire_session() {
                exclude.insert(instance.instance_id.clone());
                continue;
            }

            let started = Instant::now();
            let outcome = self
                .executor
                .execute(
                    &instance.dag,
                    &request.input,
                    deadline,
                    CancellationToken::new(),
                    &instance.instance_id,
                )
                .await;
            let latency = started.elapsed();
            let latency_ms = latency.as_secs_f64() * 1000.0;
            let success = outcome.succeeded();

            self.pool
                .release(&instance.instance_id, latency_ms, success)
                .await?;
            self.balancer
                .record_outcome(&instance.instance_id, &request.request_type, latency_ms, success)
                .await;

            if success {
                return Ok(ExecuteResponse {
                    execution_id: outcome.execution_id,
                    instance_id: instance.instance_id.clone(),
                    final_result: outcome.final_result,
                    execution_path: outcome.execution_path,
                    fallback_used: attempt > 0,
                    latency,
                });
            }

            // A deadline is terminal; an upstream failure tries the next
            // candidate.
            if let Some(err) = outcome.to_error(deadline) {
                match err {
                    OrchestratorError::Deadline(_) => return Err(err),
                    _ => {
                        tracing::warn!(
                            instance = %instance.instance_id,
                            attempt,
                            "instance failed, failing over"
                        );
                        exclude.insert(instance.instance_id.clone());
                    }
                }
            }
        }

        Err(OrchestratorError::UpstreamFailure(format!(
            "agent '{}' failed after {attempts} attempts",
            request.agent_id
        )))
    }

    /// Run a single tool call through the registry: builtins locally,
    /// remote tools at their service endpoint.
    pub async fn execute_tool(
        &self,
        tool_id: &str,
        action: &str,
        params: &Value,
        timeout: Option<Duration>,
    ) -> Result<ToolExecution> {
        self.tool_executor
            .execute(tool_id, action, params, timeout)
            .await
    }

    /// Explicitly scale an agent's fleet to `target` instances.
    pub async fn scale(&self, agent_id: &str, target: usize) -> Result<ScaleOutcome> {
        if self.pool.blueprint(agent_id).await.is_none() {
            return Err(OrchestratorError::InstanceNotFound(agent_id.to_string()));
        }
        self.pool.scale(agent_id, target).await
    }

    /// Start every background loop: discovery, probes, health checks, the
    /// autoscaler, balancer upkeep and the pool reaper.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if !background.is_empty() {
            return;
        }
        if let Some(directory) = &self.directory {
            if let Some(gateway_url) = &self.config.gateway_url {
                directory
                    .register_gateway(
                        gateway_url,
                        &GatewayRegistration {
                            service_name: self.config.service_name.clone(),
                            url: self.config.service_url.clone(),
                            health_path: "/health".into(),
                            routes: vec![
                                "/api/v1/agents".into(),
                                "/api/v1/agents/execute".into(),
                                "/api/v1/agents/scale".into(),
                            ],
                        },
                    )
                    .await;
            }
            directory.discover_all().await;
            background.extend(directory.spawn_loops(
                self.config.discovery_interval,
                self.config.health_probe_interval,
            ));
        }
        background.extend(self.monitor.spawn_loops());
        background.push(self.autoscaler.spawn_loop());
        background.extend(self.balancer.spawn_background_tasks());
        background.push(self.pool.spawn_reaper());
        tracing::info!(loops = background.len(), "orchestrator background loops started");
    }

    pub async fn shutdown(&self) {
        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            handle.abort();
        }
        let instances = self.pool.all_instances().await;
        for instance in instances {
            self.pool.remove(&instance.instance_id).await;
        }
        tracing::info!("orchestrator shut down");
    }

    fn build_document(
        &self,
        agent_id: &str,
        instance_id: &str,
        dag: &crate::dag::GeneratedDag,
        request: &GenerationRequest,
    ) -> InstanceDocument {
        let agent = dag
            .primary_agent()
            .and_then(|n| n.agent_config())
            .map(|config| AgentSection {
                name: config.agent_name.clone(),
                description: String::new(),
                instructions: config.instructions.clone(),
                model_config: serde_json::to_value(&config.model).unwrap_or(Value::Null),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                memory_enabled: false,
            })
            .unwrap_or(AgentSection {
                name: agent_id.to_string(),
                description: String::new(),
                instructions: String::new(),
                model_config: Value::Null,
                temperature: 0.7,
                max_tokens: 1000,
                memory_enabled: false,
            });

        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut details: BTreeMap<String, Value> = BTreeMap::new();
        for tool in &dag.selected_tools {
            *by_category.entry(tool.category.to_string()).or_default() += 1;
            details.insert(
                tool.id.clone(),
                serde_json::json!({
                    "name": tool.name,
                    "type": tool.tool_type.to_string(),
                    "category": tool.category.to_string(),
                    "success_rate": tool.success_rate,
                }),
            );
        }

        InstanceDocument {
            instance_id: instance_id.to_string(),
            agent_id: agent_id.to_string(),
            dag_id: dag.dag_id.clone(),
            user_id: request.user_id.clone(),
            template_id: dag.template_id.clone(),
            generation_mode: dag.mode.to_string(),
            dag: DagSection {
                nodes: dag
                    .nodes
                    .iter()
                    .map(|n| serde_json::to_value(n).unwrap_or(Value::Null))
                    .collect(),
                edges: dag
                    .edges
                    .iter()
                    .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
                    .collect(),
                execution_order: dag.execution_order.clone(),
                optimization_score: dag.optimization_score,
                estimated_cost: dag.estimated_cost,
                estimated_time: dag.estimated_time,
            },
            agent,
            tools: ToolsSection {
                total_tools: dag.selected_tools.len(),
                by_category,
                by_node: dag
                    .tool_mapping
                    .iter()
                    .map(|(node, tools)| (node.clone(), tools.clone()))
                    .collect(),
                details,
            },
            meta: MetaSection {
                created_at: dag.created_at,
                status: "idle".into(),
                health_status: "unknown".into(),
            },
        }
    }
}
