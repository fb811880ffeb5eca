//! A live agent instance: one compiled DAG bound to a worker handle plus its
//! rolling statistics. Hot fields use atomics so request paths, the balancer
//! and the health monitor can read them without contending on the stats lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::dag::GeneratedDag;
use crate::health::HealthState;
use crate::worker::WorkerHandle;

const RECENT_RESPONSE_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    Idle,
    Busy,
    Overloaded,
    Unhealthy,
    Offline,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstanceStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time: f64,
    pub error_rate: f64,
    pub recent_response_times: VecDeque<f64>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub health_score: f64,
}

/// Read-only view used by selection algorithms and the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub agent_id: String,
    pub status: InstanceStatus,
    pub active_sessions: u32,
    pub max_concurrent_sessions: u32,
    pub weight: f64,
    pub total_requests: u64,
    pub error_rate: f64,
    pub avg_response_time: f64,
    pub health_score: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub last_activity_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl InstanceSnapshot {
    pub fn session_load(&self) -> f64 {
        self.active_sessions as f64 / self.max_concurrent_sessions.max(1) as f64
    }
}

#[derive(Debug)]
pub struct AgentInstance {
    pub instance_id: String,
    pub agent_id: String,
    pub worker: WorkerHandle,
    pub dag: Arc<GeneratedDag>,
    pub max_concurrent_sessions: u32,
    pub weight: f64,
    pub created_at: DateTime<Utc>,

    status: RwLock<InstanceStatus>,
    health_state: RwLock<HealthState>,
    active_sessions: AtomicU32,
    last_activity_ms: AtomicU64,
    // Health score scaled by 10 so a [0, 100] float fits an atomic.
    health_score_x10: AtomicU32,
    stats: Mutex<InstanceStats>,
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl AgentInstance {
    pub fn new(
        instance_id: impl Into<String>,
        agent_id: impl Into<String>,
        worker: WorkerHandle,
        dag: Arc<GeneratedDag>,
        max_concurrent_sessions: u32,
        weight: f64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            agent_id: agent_id.into(),
            worker,
            dag,
            max_concurrent_sessions,
            weight,
            created_at: Utc::now(),
            status: RwLock::new(InstanceStatus::Initializing),
            health_state: RwLock::new(HealthState::Unknown),
            active_sessions: AtomicU32::new(0),
            last_activity_ms: AtomicU64::new(epoch_millis()),
            health_score_x10: AtomicU32::new(1000),
            stats: Mutex::new(InstanceStats {
                health_score: 100.0,
                ..InstanceStats::default()
            }),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.read().expect("status lock")
    }

    pub fn set_status(&self, status: InstanceStatus) {
        *self.status.write().expect("status lock") = status;
    }

    pub fn health_state(&self) -> HealthState {
        *self.health_state.read().expect("health lock")
    }

    pub fn set_health_state(&self, state: HealthState) {
        *self.health_state.write().expect("health lock") = state;
    }

    pub fn active_sessions(&self) -> u32 {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn health_score(&self) -> f64 {
        self.health_score_x10.load(Ordering::Acquire) as f64 / 10.0
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(epoch_millis(), Ordering::Release);
    }

    /// Reserve a session slot. The compare-exchange keeps the invariant
    /// `active_sessions <= max_concurrent_sessions` under concurrency.
    pub fn try_acquire_session(&self) -> bool {
        let acquired = self
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_concurrent_sessions).then_some(current + 1)
            })
            .is_ok();
        if acquired {
            self.touch();
            self.refresh_status_from_load();
        }
        acquired
    }

    pub fn release_session(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        self.refresh_status_from_load();
    }

    /// True when the balancer may hand this instance a request.
    pub fn is_available(&self) -> bool {
        matches!(self.status(), InstanceStatus::Idle | InstanceStatus::Busy)
            && self.active_sessions() < self.max_concurrent_sessions
            && self.health_score() > 20.0
    }

    /// Fold one completed request into the rolling stats and recompute the
    /// health score.
    pub async fn record_request(&self, latency_ms: f64, success: bool) {
        let mut stats = self.stats.lock().await;
        stats.total_requests += 1;
        if success {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }
        if stats.recent_response_times.len() == RECENT_RESPONSE_CAP {
            stats.recent_response_times.pop_front();
        }
        stats.recent_response_times.push_back(latency_ms);
        stats.avg_response_time = stats.recent_response_times.iter().sum::<f64>()
            / stats.recent_response_times.len() as f64;
        stats.error_rate = stats.failed_requests as f64 / stats.total_requests as f64;

        let score = compute_health_score(
            &stats,
            self.active_sessions(),
            self.max_concurrent_sessions,
        );
        stats.health_score = score;
        drop(stats);

        self.store_health_score(score);
        self.touch();
        self.refresh_status_from_load();
    }

    pub async fn set_resource_usage(&self, cpu_usage: f64, memory_usage: f64) {
        let mut stats = self.stats.lock().await;
        stats.cpu_usage = cpu_usage;
        stats.memory_usage = memory_usage;
        let score = compute_health_score(
            &stats,
            self.active_sessions(),
            self.max_concurrent_sessions,
        );
        stats.health_score = score;
        drop(stats);
        self.store_health_score(score);
    }

    /// The monitor writes the score from its latest check result.
    pub async fn set_health_score(&self, score: f64) {
        let clamped = score.clamp(0.0, 100.0);
        self.stats.lock().await.health_score = clamped;
        self.store_health_score(clamped);
    }

    pub async fn snapshot(&self) -> InstanceSnapshot {
        let stats = self.stats.lock().await;
        InstanceSnapshot {
            instance_id: self.instance_id.clone(),
            agent_id: self.agent_id.clone(),
            status: self.status(),
            active_sessions: self.active_sessions(),
            max_concurrent_sessions: self.max_concurrent_sessions,
            weight: self.weight,
            total_requests: stats.total_requests,
            error_rate: stats.error_rate,
            avg_response_time: stats.avg_response_time,
            health_score: stats.health_score,
            cpu_usage: stats.cpu_usage,
            memory_usage: stats.memory_usage,
            last_activity_ms: self.last_activity_ms(),
            created_at: self.created_at,
        }
    }

    fn store_health_score(&self, score: f64) {
        self.health_score_x10
            .store((score.clamp(0.0, 100.0) * 10.0) as u32, Ordering::Release);
    }

    fn refresh_status_from_load(&self) {
        let current = self.status();
        if matches!(
            current,
            InstanceStatus::Initializing | InstanceStatus::Unhealthy | InstanceStatus::Offline
        ) {
            return;
        }
        let active = self.active_sessions();
        let next = if active >= self.max_concurrent_sessions {
            InstanceStatus::Overloaded
        } else if active > 0 {
            InstanceStatus::Busy
        } else {
            InstanceStatus::Idle
        };
        if next != current {
            self.set_status(next);
        }
    }
}

/// Health score: start at 100 and subtract penalties for slow responses,
/// errors, saturation, and resource pressure. Clamped to [0, 100].
fn compute_health_score(stats: &InstanceStats, active_sessions: u32, max_sessions: u32) -> f64 {
    let mut score = 100.0;

    if stats.avg_response_time > 1000.0 {
        score -= ((stats.avg_response_time - 1000.0) / 100.0).min(30.0);
    }
    score -= stats.error_rate * 50.0;

    let load_ratio = active_sessions as f64 / max_sessions.max(1) as f64;
    if load_ratio > 0.8 {
        score -= (load_ratio - 0.8) * 100.0;
    }
    if stats.cpu_usage > 80.0 {
        score -= (stats.cpu_usage - 80.0) * 0.5;
    }
    if stats.memory_usage > 80.0 {
        score -= (stats.memory_usage - 80.0) * 0.5;
    }

    score.clamp(0.0, 100.0)
}
