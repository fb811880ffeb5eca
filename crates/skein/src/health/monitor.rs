//! Multi-tier health monitoring: five check loops at different cadences,
//! rolling per-instance results, alert rules and unhealthy eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::checks::{
    aggregate_states, CheckKind, HealthCheckResult, HealthMetric, HealthState,
};
use crate::dag::CmpOp;
use crate::events::{EventSink, OrchestratorEvent};
use crate::pool::{AgentInstance, InstancePool, InstanceStatus};
use crate::worker::WorkerRuntime;

const SYNTHETIC_PROBE_MESSAGE: &str = "health check: reply with a short acknowledgement";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub basic_interval: Duration,
    pub performance_interval: Duration,
    pub resource_interval: Duration,
    pub functionality_interval: Duration,
    pub comprehensive_interval: Duration,
    pub unhealthy_eviction_after: Duration,
    pub history_cap: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            basic_interval: Duration::from_secs(30),
            performance_interval: Duration::from_secs(60),
            resource_interval: Duration::from_secs(120),
            functionality_interval: Duration::from_secs(300),
            comprehensive_interval: Duration::from_secs(600),
            unhealthy_eviction_after: Duration::from_secs(300),
            history_cap: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCondition {
    pub metric: String,
    pub op: CmpOp,
    pub threshold: f64,
}

/// A rule evaluated against every check result; a match emits an alerting
/// status event. Triggering never blocks the check loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub status_condition: Option<HealthState>,
    pub metric_conditions: Vec<MetricCondition>,
    pub severity: String,
    pub message: String,
}

impl AlertRule {
    pub fn matches(&self, result: &HealthCheckResult) -> bool {
        if let Some(status) = self.status_condition {
            if result.state != status {
                return false;
            }
        }
        self.metric_conditions.iter().all(|condition| {
            result
                .metric(&condition.metric)
                .map(|m| condition.op.compare(m.value, condition.threshold))
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealthSummary {
    pub instance_id: String,
    pub state: HealthState,
    pub score: f64,
    pub last_check: Option<CheckKind>,
}

pub struct HealthMonitor {
    config: MonitorConfig,
    pool: Arc<InstancePool>,
    worker: Arc<dyn WorkerRuntime>,
    events: Arc<dyn EventSink>,
    rules: RwLock<Vec<AlertRule>>,
    history: RwLock<HashMap<String, VecDeque<HealthCheckResult>>>,
    unhealthy_since: RwLock<HashMap<String, Instant>>,
}

impl HealthMonitor {
    pub fn new(
        config: MonitorConfig,
        pool: Arc<InstancePool>,
        worker: Arc<dyn WorkerRuntime>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            pool,
            worker,
            events,
            rules: RwLock::new(Vec::new()),
            history: RwLock::new(HashMap::new()),
            unhealthy_since: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        self.rules.write().await.push(rule);
    }

    pub async fn remove_rule(&self, rule_id: &str) {
        self.rules.write().await.retain(|r| r.id != rule_id);
    }

    /// Run one check of the given kind against one instance.
    pub async fn check_instance(
        &self,
        instance: &AgentInstance,
        kind: CheckKind,
    ) -> HealthCheckResult {
        match kind {
            CheckKind::Basic => self.basic_check(instance).await,
            CheckKind::Performance => self.performance_check(instance).await,
            CheckKind::Resource => self.resource_check(instance).await,
            CheckKind::Functionality => self.functionality_check(instance).await,
            CheckKind::Comprehensive => {
                let sub_checks = [
                    self.basic_check(instance).await,
                    self.performance_check(instance).await,
                    self.resource_check(instance).await,
                    self.functionality_check(instance).await,
                ];
                let states: Vec<HealthState> = sub_checks.iter().map(|r| r.state).collect();
                let metrics = sub_checks
                    .into_iter()
                    .flat_map(|r| r.metrics.into_iter())
                    .collect();
                let mut result =
                    HealthCheckResult::new(&instance.instance_id, CheckKind::Comprehensive, metrics);
                result.state = aggregate_states(&states);
                result
            }
        }
    }

    async fn basic_check(&self, instance: &AgentInstance) -> HealthCheckResult {
        match self.worker.ping(&instance.worker).await {
            Ok(round_trip) => {
                let rt_ms = round_trip.as_secs_f64() * 1000.0;
                HealthCheckResult::new(
                    &instance.instance_id,
                    CheckKind::Basic,
                    vec![
                        HealthMetric::high_is_bad("response_time", rt_ms, 2000.0, 5000.0),
                        HealthMetric::low_is_bad("connectivity", 1.0, 0.5, 0.1),
                    ],
                )
            }
            Err(err) => HealthCheckResult::new(
                &instance.instance_id,
                CheckKind::Basic,
                vec![HealthMetric::low_is_bad("connectivity", 0.0, 0.5, 0.1)],
            )
            .with_error(err.to_string()),
        }
    }

    async fn performance_check(&self, instance: &AgentInstance) -> HealthCheckResult {
        let snapshot = instance.snapshot().await;
        HealthCheckResult::new(
            &instance.instance_id,
            CheckKind::Performance,
            vec![
                HealthMetric::high_is_bad("error_rate", snapshot.error_rate, 0.05, 0.1),
                HealthMetric::high_is_bad(
                    "avg_response_time",
                    snapshot.avg_response_time,
                    2000.0,
                    5000.0,
                ),
                HealthMetric::high_is_bad("session_load", snapshot.session_load(), 0.8, 0.95),
            ],
        )
    }

    async fn resource_check(&self, instance: &AgentInstance) -> HealthCheckResult {
        let snapshot = instance.snapshot().await;
        HealthCheckResult::new(
            &instance.instance_id,
            CheckKind::Resource,
            vec![
                HealthMetric::high_is_bad("cpu_usage", snapshot.cpu_usage, 70.0, 90.0),
                HealthMetric::high_is_bad("memory_usage", snapshot.memory_usage, 80.0, 95.0),
            ],
        )
    }

    async fn functionality_check(&self, instance: &AgentInstance) -> HealthCheckResult {
        let started = Instant::now();
        match self.worker.run(&instance.worker, SYNTHETIC_PROBE_MESSAGE).await {
            Ok(reply) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                let quality = (reply.text.len() as f64 / 100.0).min(1.0);
                HealthCheckResult::new(
                    &instance.instance_id,
                    CheckKind::Functionality,
                    vec![
                        HealthMetric::high_is_bad(
                            "function_response_time",
                            elapsed_ms,
                            10_000.0,
                            30_000.0,
                        ),
                        HealthMetric::low_is_bad("functionality", 1.0, 0.5, 0.1),
                        HealthMetric::low_is_bad("response_quality", quality, 0.7, 0.3),
                    ],
                )
            }
            Err(err) => HealthCheckResult::new(
                &instance.instance_id,
                CheckKind::Functionality,
                vec![
                    HealthMetric::low_is_bad("functionality", 0.0, 0.5, 0.1),
                    HealthMetric::low_is_bad("response_quality", 0.0, 0.7, 0.3),
                ],
            )
            .with_error(err.to_string()),
        }
    }

    /// One sweep of a check kind over every pooled instance: score updates,
    /// state transitions, alert rules and unhealthy eviction.
    pub async fn run_check_cycle(&self, kind: CheckKind) {
        let instances = self.pool.all_instances().await;
        for instance in instances {
            let result = self.check_instance(&instance, kind).await;
            self.apply_result(&instance, result).await;
        }
    }

    async fn apply_result(&self, instance: &AgentInstance, result: HealthCheckResult) {
        instance.set_health_score(result.overall_score()).await;

        let previous = instance.health_state();
        instance.set_health_state(result.state);
        if result.state != previous {
            self.events.emit(OrchestratorEvent::StatusChanged {
                instance_id: instance.instance_id.clone(),
                status: result.state.to_string(),
                alert: None,
            });
        }

        if result.state == HealthState::Critical {
            instance.set_status(InstanceStatus::Unhealthy);
        } else if instance.status() == InstanceStatus::Unhealthy {
            instance.set_status(InstanceStatus::Idle);
        }

        self.check_alert_rules(&result).await;
        self.track_unhealthy(instance, result.state).await;

        let mut history = self.history.write().await;
        let entry = history
            .entry(instance.instance_id.clone())
            .or_insert_with(VecDeque::new);
        if entry.len() == self.config.history_cap {
            entry.pop_front();
        }
        entry.push_back(result);
    }

    async fn check_alert_rules(&self, result: &HealthCheckResult) {
        let rules = self.rules.read().await;
        for rule in rules.iter().filter(|r| r.matches(result)) {
            tracing::warn!(
                rule = %rule.name,
                instance = %result.instance_id,
                severity = %rule.severity,
                "alert rule triggered"
            );
            self.events.emit(OrchestratorEvent::StatusChanged {
                instance_id: result.instance_id.clone(),
                status: result.state.to_string(),
                alert: Some(serde_json::json!({
                    "rule_id": rule.id,
                    "severity": rule.severity,
                    "message": rule.message,
                    "check": result.kind.to_string(),
                })),
            });
        }
    }

    async fn track_unhealthy(&self, instance: &AgentInstance, state: HealthState) {
        let mut unhealthy = self.unhealthy_since.write().await;
        match state {
            HealthState::Critical => {
                let since = unhealthy
                    .entry(instance.instance_id.clone())
                    .or_insert_with(Instant::now);
                if since.elapsed() >= self.config.unhealthy_eviction_after {
                    unhealthy.remove(&instance.instance_id);
                    drop(unhealthy);
                    tracing::warn!(
                        instance = %instance.instance_id,
                        "unhealthy past eviction window, removing"
                    );
                    self.pool.remove(&instance.instance_id).await;
                }
            }
            _ => {
                unhealthy.remove(&instance.instance_id);
            }
        }
    }

    pub async fn summary(&self) -> Vec<InstanceHealthSummary> {
        let history = self.history.read().await;
        let instances = self.pool.all_instances().await;
        let mut summaries = Vec::with_capacity(instances.len());
        for instance in instances {
            let last = history
                .get(&instance.instance_id)
                .and_then(|results| results.back());
            summaries.push(InstanceHealthSummary {
                instance_id: instance.instance_id.clone(),
                state: instance.health_state(),
                score: instance.health_score(),
                last_check: last.map(|r| r.kind),
            });
        }
        summaries
    }

    pub async fn history_for(&self, instance_id: &str) -> Vec<HealthCheckResult> {
        self.history
            .read()
            .await
            .get(instance_id)
            .map(|results| results.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Spawn the five check loops. Handles are owned by the caller.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let cadences = [
            (CheckKind::Basic, self.config.basic_interval),
            (CheckKind::Performance, self.config.performance_interval),
            (CheckKind::Resource, self.config.resource_interval),
            (CheckKind::Functionality, self.config.functionality_interval),
            (CheckKind::Comprehensive, self.config.comprehensive_interval),
        ];
        cadences
            .into_iter()
            .map(|(kind, interval)| {
                let monitor = Arc::clone(self);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        monitor.run_check_cycle(kind).await;
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{GenerationMode, GeneratedDag, UserPreferences};
    use crate::events::ChannelSink;
    use crate::pool::{AgentBlueprint, PoolConfig};
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
            tool_mapping: std::collections::HashMap::new(),
            mode: GenerationMode::Custom,
            optimization_score: 0.0,
            estimated_cost: 0.0,
            estimated_time: 0.0,
            created_at: Utc::now(),
        })
    }

    async fn monitor_fixture(
        config: MonitorConfig,
    ) -> (
        Arc<InstancePool>,
        Arc<InMemoryWorker>,
        Arc<HealthMonitor>,
        tokio::sync::mpsc::UnboundedReceiver<crate::events::OrchestratorEvent>,
    ) {
        let worker = Arc::new(InMemoryWorker::new());
        let (sink, rx) = ChannelSink::channel();
        let pool = Arc::new(InstancePool::new(
            PoolConfig::default(),
            Arc::clone(&worker) as Arc<dyn WorkerRuntime>,
            Arc::clone(&sink) as Arc<dyn EventSink>,
        ));
        pool.register_blueprint(AgentBlueprint {
            agent_id: "a1".into(),
            dag: empty_dag(),
            worker_config: default_worker_config("a1"),
            preferences: UserPreferences::default(),
        })
        .await;
        let monitor = Arc::new(HealthMonitor::new(
            config,
            Arc::clone(&pool),
            Arc::clone(&worker) as Arc<dyn WorkerRuntime>,
            sink,
        ));
        (pool, worker, monitor, rx)
    }

    #[tokio::test]
    async fn test_basic_check_healthy_instance() {
        let (pool, _worker, monitor, _rx) = monitor_fixture(MonitorConfig::default()).await;
        let instance = pool.create("a1").await.unwrap();

        let result = monitor.check_instance(&instance, CheckKind::Basic).await;
        assert_eq!(result.state, HealthState::Healthy);
        assert_eq!(result.metric("connectivity").unwrap().value, 1.0);
    }

    #[tokio::test]
    async fn test_basic_check_unreachable_worker_is_critical() {
        let (pool, worker, monitor, _rx) = monitor_fixture(MonitorConfig::default()).await;
        let instance = pool.create("a1").await.unwrap();
        worker.destroy(&instance.worker).await.unwrap();

        let result = monitor.check_instance(&instance, CheckKind::Basic).await;
        assert_eq!(result.state, HealthState::Critical);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_performance_check_reads_rolling_stats() {
        let (pool, _worker, monitor, _rx) = monitor_fixture(MonitorConfig::default()).await;
        let instance = pool.create("a1").await.unwrap();
        // 1 failure in 10 requests: error_rate 0.1 hits the critical bar.
        for _ in 0..9 {
            instance.record_request(100.0, true).await;
        }
        instance.record_request(100.0, false).await;

        let result = monitor
            .check_instance(&instance, CheckKind::Performance)
            .await;
        assert_eq!(result.state, HealthState::Critical);
        assert_eq!(result.metric("error_rate").unwrap().state(), HealthState::Critical);
    }

    #[tokio::test]
    async fn test_comprehensive_escalates_two_warnings() {
        let (pool, _worker, monitor, _rx) = monitor_fixture(MonitorConfig::default()).await;
        let instance = pool.create("a1").await.unwrap();
        // cpu in its warning band, and an average response time in the
        // latency warning band: one warning from the resource check, one
        // from the performance check.
        instance.set_resource_usage(75.0, 40.0).await;
        for _ in 0..3 {
            instance.record_request(3000.0, true).await;
        }

        let resource = monitor.check_instance(&instance, CheckKind::Resource).await;
        assert_eq!(resource.state, HealthState::Warning);
        let performance = monitor
            .check_instance(&instance, CheckKind::Performance)
            .await;
        assert_eq!(performance.state, HealthState::Warning);

        // Two warning sub-checks escalate the comprehensive state.
        let comprehensive = monitor
            .check_instance(&instance, CheckKind::Comprehensive)
            .await;
        assert_eq!(comprehensive.state, HealthState::Critical);
    }

    #[tokio::test]
    async fn test_cycle_updates_instance_score_and_state() {
        let (pool, _worker, monitor, _rx) = monitor_fixture(MonitorConfig::default()).await;
        let instance = pool.create("a1").await.unwrap();

        monitor.run_check_cycle(CheckKind::Basic).await;
        assert_eq!(instance.health_state(), HealthState::Healthy);
        assert!((instance.health_score() - 100.0).abs() < f64::EPSILON);

        let summaries = monitor.summary().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].last_check, Some(CheckKind::Basic));
    }

    #[tokio::test]
    async fn test_unhealthy_instance_evicted_after_window() {
        let config = MonitorConfig {
            unhealthy_eviction_after: Duration::from_secs(0),
            ..MonitorConfig::default()
        };
        let (pool, worker, monitor, _rx) = monitor_fixture(config).await;
        let instance = pool.create("a1").await.unwrap();
        worker.destroy(&instance.worker).await.unwrap();

        // With a zero-length window the first critical check already evicts.
        monitor.run_check_cycle(CheckKind::Basic).await;
        assert!(pool.get(&instance.instance_id).await.is_none());
    }

    #[tokio::test]
    async fn test_alert_rule_emits_event() {
        let (pool, worker, monitor, mut rx) = monitor_fixture(MonitorConfig::default()).await;
        let instance = pool.create("a1").await.unwrap();
        // Drain pool-creation events.
        while rx.try_recv().is_ok() {}

        monitor
            .add_rule(AlertRule {
                id: "r1".into(),
                name: "connectivity-lost".into(),
                status_condition: Some(HealthState::Critical),
                metric_conditions: vec![MetricCondition {
                    metric: "connectivity".into(),
                    op: CmpOp::Lt,
                    threshold: 0.5,
                }],
                severity: "critical".into(),
                message: "worker unreachable".into(),
            })
            .await;

        worker.destroy(&instance.worker).await.unwrap();
        monitor.run_check_cycle(CheckKind::Basic).await;

        let mut saw_alert = false;
        while let Ok(event) = rx.try_recv() {
            if let crate::events::OrchestratorEvent::StatusChanged { alert: Some(alert), .. } = event
            {
                assert_eq!(alert["rule_id"], "r1");
                saw_alert = true;
            }
        }
        assert!(saw_alert);
    }

    #[test]
    fn test_rule_requires_all_metric_conditions() {
        let rule = AlertRule {
            id: "r".into(),
            name: "n".into(),
            status_condition: None,
            metric_conditions: vec![
                MetricCondition {
                    metric: "cpu_usage".into(),
                    op: CmpOp::Ge,
                    threshold: 70.0,
                },
                MetricCondition {
                    metric: "memory_usage".into(),
                    op: CmpOp::Ge,
                    threshold: 95.0,
                },
            ],
            severity: "warning".into(),
            message: "m".into(),
        };
        let result = HealthCheckResult::new(
            "i1",
            CheckKind::Resource,
            vec![
                HealthMetric::high_is_bad("cpu_usage", 80.0, 70.0, 90.0),
                HealthMetric::high_is_bad("memory_usage", 85.0, 80.0, 95.0),
            ],
        );
        assert!(!rule.matches(&result));
    }
}
