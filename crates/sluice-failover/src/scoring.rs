//! Learned transport reliability.
//!
//! Every attempt feeds two estimators: an exponential moving average of the
//! success rate (the "base rate", kept for the orchestrator's lifetime) and
//! rolling windows of recent outcomes and latencies. A [`ScoringStrategy`]
//! turns them into one reliability number used for ordering.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ErrorCategory;

/// Outcomes kept in the rolling success window.
pub const OUTCOME_WINDOW: usize = 20;
/// Latency samples kept for the rolling mean.
pub const LATENCY_WINDOW: usize = 10;
/// Base rate of a transport that has never been tried.
pub const INITIAL_RATE: f64 = 0.5;
/// EMA decay applied to the previous rate on every update.
pub const EMA_DECAY: f64 = 0.9;

/// Weight of the success rate in the reliability score.
pub const SUCCESS_WEIGHT: f64 = 0.7;
/// Weight of the latency score in the reliability score.
pub const LATENCY_WEIGHT: f64 = 0.3;

/// One EMA step: `rate*0.9 + 0.1` on success, `rate*0.9` on failure.
pub fn ema_update(rate: f64, success: bool) -> f64 {
    let next = rate * EMA_DECAY + if success { 1.0 - EMA_DECAY } else { 0.0 };
    next.clamp(0.0, 1.0)
}

/// Map a mean latency to [0, 1].
///
/// Up to 5 s falls linearly from 1.0 to 0.5, 5–15 s from 0.5 to 0.0, and
/// anything slower scores 0.
pub fn latency_score(avg: Duration) -> f64 {
    let secs = avg.as_secs_f64();
    if secs <= 5.0 {
        1.0 - 0.5 * (secs / 5.0)
    } else if secs <= 15.0 {
        0.5 - 0.5 * ((secs - 5.0) / 10.0)
    } else {
        0.0
    }
}

/// Learned history of one transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportScore {
    pub name: String,
    /// EMA success rate, always in [0, 1].
    pub base_rate: f64,
    outcomes: VecDeque<bool>,
    latencies: VecDeque<Duration>,
    pub attempts: u64,
    pub failures: u64,
    pub last_category: Option<ErrorCategory>,
}

impl TransportScore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base_rate: INITIAL_RATE,
            outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            attempts: 0,
            failures: 0,
            last_category: None,
        }
    }

    /// Seed the base rate, e.g. from a previous session.
    pub fn with_base_rate(mut self, rate: f64) -> Self {
        self.base_rate = if rate.is_finite() {
            rate.clamp(0.0, 1.0)
        } else {
            INITIAL_RATE
        };
        self
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.attempts += 1;
        self.base_rate = ema_update(self.base_rate, true);
        push_bounded(&mut self.outcomes, true, OUTCOME_WINDOW);
        push_bounded(&mut self.latencies, latency, LATENCY_WINDOW);
    }

    pub fn record_failure(&mut self, category: ErrorCategory) {
        self.attempts += 1;
        self.failures += 1;
        self.base_rate = ema_update(self.base_rate, false);
        self.last_category = Some(category);
        push_bounded(&mut self.outcomes, false, OUTCOME_WINDOW);
    }

    /// Successes over the rolling window, `None` while the window is empty.
    pub fn window_success_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let successes = self.outcomes.iter().filter(|ok| **ok).count();
        Some(successes as f64 / self.outcomes.len() as f64)
    }

    /// Mean of the last latency samples.
    pub fn avg_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    /// Latency component of the reliability score; 1.0 without samples.
    pub fn latency_score(&self) -> f64 {
        self.avg_latency().map_or(1.0, latency_score)
    }

    pub fn window_len(&self) -> usize {
        self.outcomes.len()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, cap: usize) {
    if queue.len() == cap {
        queue.pop_front();
    }
    queue.push_back(value);
}

/// Turns a [`TransportScore`] into the numbers ordering decisions use.
pub trait ScoringStrategy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Success rate in [0, 1].
    fn success_rate(&self, score: &TransportScore) -> f64;

    /// `0.7 * success_rate + 0.3 * latency_score`.
    fn reliability(&self, score: &TransportScore) -> f64 {
        SUCCESS_WEIGHT * self.success_rate(score) + LATENCY_WEIGHT * score.latency_score()
    }
}

/// Rolling-window success rate, falling back to the EMA base rate while the
/// window is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowedReliability;

impl ScoringStrategy for WindowedReliability {
    fn name(&self) -> &'static str {
        "windowed"
    }

    fn success_rate(&self, score: &TransportScore) -> f64 {
        score.window_success_rate().unwrap_or(score.base_rate)
    }
}

/// Pure EMA: long memory, slow to forgive and slow to trust.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressiveReliability;

impl ScoringStrategy for ProgressiveReliability {
    fn name(&self) -> &'static str {
        "progressive"
    }

    fn success_rate(&self, score: &TransportScore) -> f64 {
        score.base_rate
    }
}

/// A transport as seen by the ranking function.
#[derive(Debug, Clone, Copy)]
pub struct RankEntry<'a> {
    pub name: &'a str,
    pub priority: i32,
    pub reliability: f64,
}

/// Order entries for a transfer; returns indices into `entries`.
///
/// Keys: reliability (descending), then the preferred transport, then
/// declared priority (descending), then registration order.
pub fn rank(entries: &[RankEntry<'_>], preferred: Option<&str>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| {
        let (a, b) = (&entries[a], &entries[b]);
        b.reliability
            .total_cmp(&a.reliability)
            .then_with(|| match preferred {
                Some(p) => (b.name == p).cmp(&(a.name == p)),
                None => Ordering::Equal,
            })
            .then_with(|| b.priority.cmp(&a.priority))
    });
    order
}
