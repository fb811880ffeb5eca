//! Autoscaling: smoothed metric samples evaluated against per-agent rules,
//! one instance up or down per decision, cooldown between actions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::{OrchestratorError, Result};
use crate::events::{EventSink, OrchestratorEvent};
use crate::pool::InstancePool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    pub optimization_interval: Duration,
    pub metrics_window: usize,
    pub min_data_points: usize,
    pub smoothing_samples: usize,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            optimization_interval: Duration::from_secs(60),
            metrics_window: 100,
            min_data_points: 3,
            smoothing_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScalingMetric {
    LoadRatio,
    AvgResponseTime,
    ErrorRate,
    CpuUsage,
    MemoryUsage,
    HealthRatio,
    QueueLength,
    QueueWaitTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingRule {
    pub rule_id: String,
    pub agent_id: String,
    pub metric: ScalingMetric,
    pub threshold_up: f64,
    pub threshold_down: f64,
    pub min_instances: usize,
    pub max_instances: usize,
    pub cooldown: Duration,
    pub enabled: bool,
}

impl ScalingRule {
    pub fn validate(&self) -> Result<()> {
        if self.threshold_up <= self.threshold_down {
            return Err(OrchestratorError::DagInvalid(format!(
                "scaling rule '{}': threshold_up must exceed threshold_down",
                self.rule_id
            )));
        }
        if self.min_instances >= self.max_instances {
            return Err(OrchestratorError::DagInvalid(format!(
                "scaling rule '{}': min_instances must be below max_instances",
                self.rule_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

/// One metrics observation for an agent's fleet.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSample {
    pub load_ratio: f64,
    pub avg_response_time: f64,
    pub error_rate: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub health_ratio: f64,
    pub queue_length: f64,
    pub queue_wait_time: f64,
}

impl MetricsSample {
    pub fn value(&self, metric: ScalingMetric) -> f64 {
        match metric {
            ScalingMetric::LoadRatio => self.load_ratio,
            ScalingMetric::AvgResponseTime => self.avg_response_time,
            ScalingMetric::ErrorRate => self.error_rate,
            ScalingMetric::CpuUsage => self.cpu_usage,
            ScalingMetric::MemoryUsage => self.memory_usage,
            ScalingMetric::HealthRatio => self.health_ratio,
            ScalingMetric::QueueLength => self.queue_length,
            ScalingMetric::QueueWaitTime => self.queue_wait_time,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalingEvent {
    pub agent_id: String,
    pub rule_id: String,
    pub action: ScalingAction,
    pub trigger_metric: ScalingMetric,
    pub metric_value: f64,
    pub threshold: f64,
    pub before: usize,
    pub after: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoscalerStats {
    pub tracked_agents: usize,
    pub total_rules: usize,
    pub scaling_events: usize,
}

pub struct Autoscaler {
    config: AutoscalerConfig,
    pool: Arc<InstancePool>,
    events: Arc<dyn EventSink>,
    rules: RwLock<HashMap<String, Vec<ScalingRule>>>,
    history: RwLock<HashMap<String, VecDeque<MetricsSample>>>,
    last_scaling: RwLock<HashMap<String, Instant>>,
    event_log: RwLock<Vec<ScalingEvent>>,
}

impl Autoscaler {
    pub fn new(
        config: AutoscalerConfig,
        pool: Arc<InstancePool>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            pool,
            events,
            rules: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            last_scaling: RwLock::new(HashMap::new()),
            event_log: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_rule(&self, rule: ScalingRule) -> Result<()> {
        rule.validate()?;
        self.rules
            .write()
            .await
            .entry(rule.agent_id.clone())
            .or_default()
            .push(rule);
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: &str) {
        let mut rules = self.rules.write().await;
        for agent_rules in rules.values_mut() {
            agent_rules.retain(|r| r.rule_id != rule_id);
        }
    }

    /// The load-ratio rule attached to every new agent.
    pub fn default_rule(&self, agent_id: &str) -> ScalingRule {
        ScalingRule {
            rule_id: format!("{agent_id}-load"),
            agent_id: agent_id.to_string(),
            metric: ScalingMetric::LoadRatio,
            threshold_up: 0.8,
            threshold_down: 0.3,
            min_instances: self.pool.config().min_instances_per_agent,
            max_instances: self.pool.config().max_instances_per_agent,
            cooldown: Duration::from_secs(300),
            enabled: true,
        }
    }

    /// Aggregate the agent's fleet into one sample. Queue metrics stay zero;
    /// the core holds no request queue.
    pub async fn collect_sample(&self, agent_id: &str) -> Option<MetricsSample> {
        let instances = self.pool.instances_for(agent_id).await;
        if instances.is_empty() {
            return None;
        }

        let mut sample = MetricsSample::default();
        let mut healthy = 0usize;
        for instance in &instances {
            let snapshot = instance.snapshot().await;
            sample.load_ratio += snapshot.session_load();
            sample.avg_response_time += snapshot.avg_response_time;
            sample.error_rate += snapshot.error_rate;
            sample.cpu_usage += snapshot.cpu_usage;
            sample.memory_usage += snapshot.memory_usage;
            if snapshot.health_score > 60.0 {
                healthy += 1;
            }
        }
        let n = instances.len() as f64;
        sample.load_ratio /= n;
        sample.avg_response_time /= n;
        sample.error_rate /= n;
        sample.cpu_usage /= n;
        sample.memory_usage /= n;
        sample.health_ratio = healthy as f64 / n;
        Some(sample)
    }

    /// Append a sample to the bounded history.
    pub async fn record_sample(&self, agent_id: &str, sample: MetricsSample) {
        let mut history = self.history.write().await;
        let entry = history.entry(agent_id.to_string()).or_default();
        if entry.len() == self.config.metrics_window {
            entry.pop_front();
        }
        entry.push_back(sample);
    }

    /// Mean of the most recent samples; `None` below `min_data_points`.
    pub async fn smoothed(&self, agent_id: &str) -> Option<MetricsSample> {
        let history = self.history.read().await;
        let samples = history.get(agent_id)?;
        if samples.len() < self.config.min_data_points {
            return None;
        }
        let window = samples
            .iter()
            .rev()
            .take(self.config.smoothing_samples)
            .collect::<Vec<_>>();
        let n = window.len() as f64;
        let mut mean = MetricsSample::default();
        for sample in window {
            mean.load_ratio += sample.load_ratio / n;
            mean.avg_response_time += sample.avg_response_time / n;
            mean.error_rate += sample.error_rate / n;
            mean.cpu_usage += sample.cpu_usage / n;
            mean.memory_usage += sample.memory_usage / n;
            mean.health_ratio += sample.health_ratio / n;
            mean.queue_length += sample.queue_length / n;
            mean.queue_wait_time += sample.queue_wait_time / n;
        }
        Some(mean)
    }

    /// Evaluate the agent's rules against a smoothed sample. The first
    /// enabled rule that crosses a threshold decides; cooldown gates any
    /// action.
    pub async fn evaluate(&self, agent_id: &str, sample: &MetricsSample) -> Option<ScalingEvent> {
        let rules = self.rules.read().await;
        let agent_rules = rules.get(agent_id)?;

        {
            let last_scaling = self.last_scaling.read().await;
            if let Some(last) = last_scaling.get(agent_id) {
                let min_cooldown = agent_rules
                    .iter()
                    .filter(|r| r.enabled)
                    .map(|r| r.cooldown)
                    .min()?;
                if last.elapsed() < min_cooldown {
                    return None;
                }
            }
        }

        for rule in agent_rules.iter().filter(|r| r.enabled) {
            let value = sample.value(rule.metric);
            let action = if value >= rule.threshold_up {
                ScalingAction::ScaleUp
            } else if value <= rule.threshold_down {
                ScalingAction::ScaleDown
            } else {
                ScalingAction::NoAction
            };
            if action == ScalingAction::NoAction {
                continue;
            }

            let current = self.pool.instances_for(agent_id).await.len();
            let target = match action {
                ScalingAction::ScaleUp => (current + 1).min(rule.max_instances),
                ScalingAction::ScaleDown => current.saturating_sub(1).max(rule.min_instances),
                ScalingAction::NoAction => current,
            };
            if target == current {
                return None;
            }

            return Some(ScalingEvent {
                agent_id: agent_id.to_string(),
                rule_id: rule.rule_id.clone(),
                action,
                trigger_metric: rule.metric,
                metric_value: value,
                threshold: match action {
                    ScalingAction::ScaleUp => rule.threshold_up,
                    _ => rule.threshold_down,
                },
                before: current,
                after: target,
                at: Utc::now(),
            });
        }
        None
    }

    /// Apply a scaling decision through the pool and stamp the cooldown.
    pub async fn apply(&self, event: ScalingEvent) -> Result<()> {
        self.pool.scale(&event.agent_id, event.after).await?;
        self.last_scaling
            .write()
            .await
            .insert(event.agent_id.clone(), Instant::now());

        tracing::info!(
            agent = %event.agent_id,
            action = %event.action,
            metric = %event.trigger_metric,
            value = event.metric_value,
            before = event.before,
            after = event.after,
            "scaling action applied"
        );
        self.events.emit(OrchestratorEvent::ScalingEvent {
            agent_id: event.agent_id.clone(),
            action: event.action.to_string(),
            before: event.before,
            after: event.after,
            trigger_metric: event.trigger_metric.to_string(),
        });
        self.event_log.write().await.push(event);
        Ok(())
    }

    /// One optimizer pass: sample, smooth, evaluate, act.
    pub async fn tick(&self) {
        let agent_ids: Vec<String> = self.rules.read().await.keys().cloned().collect();
        for agent_id in agent_ids {
            let Some(sample) = self.collect_sample(&agent_id).await else {
                continue;
            };
            self.record_sample(&agent_id, sample).await;

            let Some(smoothed) = self.smoothed(&agent_id).await else {
                continue;
            };
            if let Some(event) = self.evaluate(&agent_id, &smoothed).await {
                if let Err(err) = self.apply(event).await {
                    tracing::warn!(agent = %agent_id, error = %err, "scaling action failed");
                }
            }
        }
    }

    pub async fn events_log(&self) -> Vec<ScalingEvent> {
        self.event_log.read().await.clone()
    }

    pub async fn stats(&self) -> AutoscalerStats {
        let rules = self.rules.read().await;
        AutoscalerStats {
            tracked_agents: rules.len(),
            total_rules: rules.values().map(Vec::len).sum(),
            scaling_events: self.event_log.read().await.len(),
        }
    }

    pub fn spawn_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let autoscaler = Arc::clone(self);
        let interval = autoscaler.config.optimization_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                autoscaler.tick().await;
            }
        })
    }
}
