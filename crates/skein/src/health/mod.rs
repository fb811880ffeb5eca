//! Instance health: checks, thresholds, alerting and the monitor loops.

pub mod checks;
pub mod monitor;

pub use checks::{
    aggregate_states, CheckKind, Direction, HealthCheckResult, HealthMetric, HealthState,
};
pub use monitor::{AlertRule, HealthMonitor, InstanceHealthSummary, MetricCondition, MonitorConfig};
