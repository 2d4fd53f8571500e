//! Adaptive backoff and quality-adjusted timeouts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ErrorCategory;

/// Largest jitter fraction accepted; larger values are clamped.
pub const MAX_JITTER: f64 = 0.4;

/// Quality score below which attempt timeouts are doubled.
pub const POOR_QUALITY: f64 = 5.0;

/// Exponential backoff with escalation and symmetric jitter.
///
/// `delay(n) = base * factor^n`, multiplied by `restrictive_multiplier` on a
/// restrictive network and by `connectivity_multiplier` after port-block or
/// throttling failures, capped at `max`, then jittered by up to
/// `±jitter * delay` and capped again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: f64,
    pub restrictive_multiplier: f64,
    pub connectivity_multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
            restrictive_multiplier: 1.5,
            connectivity_multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based) without jitter.
    pub fn base_delay(&self, attempt: u32, category: ErrorCategory, restrictive: bool) -> Duration {
        let mut secs = self.base.as_secs_f64() * self.factor.max(1.0).powi(attempt.min(64) as i32);
        if restrictive {
            secs *= self.restrictive_multiplier.max(1.0);
        }
        if category.escalates_backoff() {
            secs *= self.connectivity_multiplier.max(1.0);
        }
        cap(secs, self.max)
    }

    /// Delay with jitter drawn from the thread RNG.
    pub fn delay(&self, attempt: u32, category: ErrorCategory, restrictive: bool) -> Duration {
        let unit = rand::rng().random_range(-1.0..=1.0);
        self.delay_with_unit(attempt, category, restrictive, unit)
    }

    /// Delay with an explicit jitter draw `unit` in [-1, 1].
    pub fn delay_with_unit(
        &self,
        attempt: u32,
        category: ErrorCategory,
        restrictive: bool,
        unit: f64,
    ) -> Duration {
        let base = self.base_delay(attempt, category, restrictive).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, MAX_JITTER);
        let unit = if unit.is_finite() { unit.clamp(-1.0, 1.0) } else { 0.0 };
        cap(base * (1.0 + jitter * unit), self.max)
    }
}

fn cap(secs: f64, max: Duration) -> Duration {
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Per-attempt timeout multiplier: `1 + 0.5 * attempt`, doubled on a poor
/// network (quality < 5 on the 0–10 scale).
pub fn timeout_multiplier(attempt: u32, quality: f64) -> f64 {
    let mut multiplier = 1.0 + 0.5 * f64::from(attempt);
    if quality < POOR_QUALITY {
        multiplier *= 2.0;
    }
    multiplier
}

/// `base` scaled by [`timeout_multiplier`], saturating at `Duration::MAX`.
pub fn attempt_timeout(base: Duration, attempt: u32, quality: f64) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() * timeout_multiplier(attempt, quality))
        .unwrap_or(Duration::MAX)
}
