//! Health check primitives: metrics with warn/critical thresholds and the
//! per-check result record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckKind {
    Basic,
    Performance,
    Resource,
    Functionality,
    Comprehensive,
}

/// Whether a metric degrades as it rises (latency, error rate) or as it
/// falls (connectivity, quality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HighIsBad,
    LowIsBad,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetric {
    pub name: String,
    pub value: f64,
    pub threshold_warning: f64,
    pub threshold_critical: f64,
    pub direction: Direction,
}

impl HealthMetric {
    pub fn high_is_bad(name: impl Into<String>, value: f64, warn: f64, crit: f64) -> Self {
        Self {
            name: name.into(),
            value,
            threshold_warning: warn,
            threshold_critical: crit,
            direction: Direction::HighIsBad,
        }
    }

    pub fn low_is_bad(name: impl Into<String>, value: f64, warn: f64, crit: f64) -> Self {
        Self {
            name: name.into(),
            value,
            threshold_warning: warn,
            threshold_critical: crit,
            direction: Direction::LowIsBad,
        }
    }

    pub fn state(&self) -> HealthState {
        match self.direction {
            Direction::HighIsBad => {
                if self.value >= self.threshold_critical {
                    HealthState::Critical
                } else if self.value >= self.threshold_warning {
                    HealthState::Warning
                } else {
                    HealthState::Healthy
                }
            }
            Direction::LowIsBad => {
                if self.value <= self.threshold_critical {
                    HealthState::Critical
                } else if self.value <= self.threshold_warning {
                    HealthState::Warning
                } else {
                    HealthState::Healthy
                }
            }
        }
    }

    /// Status mapped to a score contribution: 100 healthy, 60 warning,
    /// 20 critical.
    pub fn score(&self) -> f64 {
        match self.state() {
            HealthState::Healthy => 100.0,
            HealthState::Warning => 60.0,
            HealthState::Critical => 20.0,
            HealthState::Unknown => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub instance_id: String,
    pub kind: CheckKind,
    pub state: HealthState,
    pub metrics: Vec<HealthMetric>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(instance_id: impl Into<String>, kind: CheckKind, metrics: Vec<HealthMetric>) -> Self {
        let state = worst_state(&metrics);
        Self {
            instance_id: instance_id.into(),
            kind,
            state,
            metrics,
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn metric(&self, name: &str) -> Option<&HealthMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Mean of the metric scores; an empty result scores as critical.
    pub fn overall_score(&self) -> f64 {
        if self.metrics.is_empty() {
            return 20.0;
        }
        self.metrics.iter().map(HealthMetric::score).sum::<f64>() / self.metrics.len() as f64
    }
}

fn worst_state(metrics: &[HealthMetric]) -> HealthState {
    let mut worst = HealthState::Healthy;
    for metric in metrics {
        match metric.state() {
            HealthState::Critical => return HealthState::Critical,
            HealthState::Warning => worst = HealthState::Warning,
            _ => {}
        }
    }
    if metrics.is_empty() {
        HealthState::Unknown
    } else {
        worst
    }
}

/// Comprehensive aggregation: any critical sub-check is critical, two or
/// more warnings escalate to critical, one warning stays a warning.
pub fn aggregate_states(states: &[HealthState]) -> HealthState {
    if states.iter().any(|s| *s == HealthState::Critical) {
        return HealthState::Critical;
    }
    let warnings = states.iter().filter(|s| **s == HealthState::Warning).count();
    match warnings {
        0 if states.is_empty() => HealthState::Unknown,
        0 => HealthState::Healthy,
        1 => HealthState::Warning,
        _ => HealthState::Critical,
    }
}
