//! Fixed-window request/token budgets
//!
//! Counters only grow between resets. A window is reset either lazily,
//! when an eligibility check finds it expired, or unconditionally by the
//! engine's reset loop. Both paths are idempotent.

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::types::{BalancerRequest, RateLimitState};

/// Default budget window in milliseconds
pub const RATE_LIMIT_WINDOW_MS: u64 = 60_000;

impl RateLimitState {
    pub fn window_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.last_reset_at >= window
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.current_requests = 0;
        self.current_tokens = 0;
        self.last_reset_at = now;
    }

    /// Reset first if the window expired. Returns whether a reset happened.
    pub fn reset_if_expired(&mut self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.window_expired(now, window) {
            trace!(
                requests = self.current_requests,
                tokens = self.current_tokens,
                "Lazy rate-limit window reset"
            );
            self.reset(now);
            true
        } else {
            false
        }
    }

    /// Strict budget check: a request that would land exactly on the
    /// token ceiling is rejected.
    pub fn admits(&self, request: &BalancerRequest) -> bool {
        self.current_requests < self.requests_per_minute
            && self
                .current_tokens
                .saturating_add(request.total_tokens())
                < self.tokens_per_minute
    }

    pub fn charge(&mut self, request: &BalancerRequest) {
        self.current_requests = self.current_requests.saturating_add(1);
        self.current_tokens = self.current_tokens.saturating_add(request.total_tokens());
    }

    pub fn request_utilization_pct(&self) -> f64 {
        ratio_pct(self.current_requests, self.requests_per_minute)
    }

    pub fn token_utilization_pct(&self) -> f64 {
        ratio_pct(self.current_tokens, self.tokens_per_minute)
    }
}

fn ratio_pct(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64 * 100.0
    }
}
