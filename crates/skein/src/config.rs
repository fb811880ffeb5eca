//! Runtime configuration, aggregated from each component's own section.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balance::{CircuitBreakerConfig, LoadBalanceConfig};
use crate::dag::ScoreWeights;
use crate::health::MonitorConfig;
use crate::pool::PoolConfig;
use crate::scale::AutoscalerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Cadence of the tool discovery sweep.
    pub discovery_interval: Duration,
    /// Cadence of the tool-service health probe.
    pub health_probe_interval: Duration,
    /// Gateway to register with on startup; skipped when unset.
    pub gateway_url: Option<String>,
    /// How this runtime announces itself to the gateway.
    pub service_name: String,
    pub service_url: String,
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
    pub load_balance: LoadBalanceConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub autoscaler: AutoscalerConfig,
    pub score_weights: ScoreWeights,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(300),
            health_probe_interval: Duration::from_secs(60),
            gateway_url: None,
            service_name: "agent-orchestrator".into(),
            service_url: "http://localhost:8081".into(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            load_balance: LoadBalanceConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            score_weights: ScoreWeights::default(),
        }
    }
}
