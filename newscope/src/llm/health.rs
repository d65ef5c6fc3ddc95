//! Provider health scores and per-provider counters.
//!
//! Every call outcome moves the score with exponential smoothing:
//!
//!   new = old * decay + outcome * (1 - decay)      outcome = 1.0 | 0.0
//!
//! so one failure from a perfect score lands on `decay` (0.8 by default). Providers
//! below `floor` sort last but are still tried, which lets them recover.

use chrono::{DateTime, Utc};
use common::HealthConfig;
use serde::Serialize;

use super::SummaryResult;

pub const INITIAL_HEALTH: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    pub decay: f64,
    pub floor: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

impl HealthPolicy {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            decay: config.decay,
            floor: config.floor,
        }
    }

    pub fn next_score(&self, current: f64, success: bool) -> f64 {
        let outcome = if success { 1.0 } else { 0.0 };
        (current * self.decay + outcome * (1.0 - self.decay)).clamp(0.0, 1.0)
    }

    pub fn is_healthy(&self, score: f64) -> bool {
        score >= self.floor
    }
}

/// Counters owned by a single provider slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_latency_ms: u64,
    pub health_score: f64,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self {
            requests: 0,
            successes: 0,
            failures: 0,
            total_cost: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            total_latency_ms: 0,
            health_score: INITIAL_HEALTH,
            last_error: None,
            last_attempt: None,
        }
    }
}

impl ProviderStats {
    /// Fold one attempt into the counters and the health score.
    pub fn record(&mut self, result: &SummaryResult, policy: &HealthPolicy, at: DateTime<Utc>) {
        self.requests += 1;
        self.last_attempt = Some(at);
        self.total_latency_ms += result.latency_ms;
        self.health_score = policy.next_score(self.health_score, result.success);

        if result.success {
            self.successes += 1;
            self.total_cost += result.cost.max(0.0);
            self.input_tokens += result.input_tokens as u64;
            self.output_tokens += result.output_tokens as u64;
        } else {
            self.failures += 1;
            self.last_error = result.error.clone();
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.successes as f64 / self.requests as f64
    }

    pub fn avg_latency_ms(&self) -> u64 {
        if self.requests == 0 {
            return 0;
        }
        self.total_latency_ms / self.requests
    }
}
