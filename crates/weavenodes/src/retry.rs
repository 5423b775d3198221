use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry schedule for transient HTTP failures of a hosted model.
///
/// The delay before retry `n` (1-based) is
/// `initial_delay * exp_base^(n - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub initial_delay_secs: f64,
    pub exp_base: f64,
    pub max_delay_secs: f64,
    pub status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay_secs: 1.0,
            exp_base: 7.0,
            max_delay_secs: 60.0,
            status_codes: vec![429, 500, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Never panics: negative or NaN settings collapse to zero, anything
    /// too large for a `Duration` falls back to the cap.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let cap = non_negative(self.max_delay_secs);
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay_secs * self.exp_base.powi(exponent);
        let secs = if secs.is_nan() { 0.0 } else { secs.max(0.0).min(cap) };
        Duration::try_from_secs_f64(secs)
            .or_else(|_| Duration::try_from_secs_f64(cap))
            .unwrap_or(Duration::MAX)
    }

    /// Whether a response with `status` on attempt `attempt` (1-based)
    /// should be tried again.
    pub fn should_retry(&self, status: u16, attempt: u32) -> bool {
        attempt < self.attempts && self.status_codes.contains(&status)
    }
}

fn non_negative(secs: f64) -> f64 {
    if secs.is_nan() {
        0.0
    } else {
        secs.max(0.0)
    }
}
