//! Per-instance circuit breaker.
//!
//! Closed until `failure_threshold` consecutive failures, then open for
//! `open_timeout`. The first request after the timeout is a half-open trial;
//! `success_threshold` consecutive successes re-close, any failure reopens.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Non-mutating routability check, used while filtering candidates.
    pub fn can_route(&self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => self.open_timeout_elapsed(),
            BreakerState::HalfOpen => !self.probe_in_flight,
        }
    }

    /// Commit a dispatch to this instance. An open breaker past its timeout
    /// moves to half-open here, and the half-open trial slot is taken; only
    /// one trial may be in flight at a time.
    pub fn note_dispatch(&mut self) {
        match self.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                if self.open_timeout_elapsed() {
                    self.state = BreakerState::HalfOpen;
                    self.success_count = 0;
                    self.probe_in_flight = true;
                }
            }
            BreakerState::HalfOpen => {
                self.probe_in_flight = true;
            }
        }
    }

    /// `can_route` + `note_dispatch` in one step, for callers that route a
    /// single instance.
    pub fn allow_request(&mut self) -> bool {
        if !self.can_route() {
            return false;
        }
        self.note_dispatch();
        true
    }

    fn open_timeout_elapsed(&self) -> bool {
        self.last_failure_at
            .map(|at| at.elapsed() >= self.config.open_timeout)
            .unwrap_or(true)
    }

    pub fn on_success(&mut self) {
        self.probe_in_flight = false;
        match self.state {
            BreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&mut self) {
        self.probe_in_flight = false;
        self.last_failure_at = Some(Instant::now());
        self.success_count = 0;
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
            }
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }
}
