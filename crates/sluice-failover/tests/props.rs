//! Property tests for scoring, ranking and backoff.

use std::time::Duration;

use proptest::prelude::*;
use sluice_failover::scoring::{ema_update, rank, RankEntry};
use sluice_failover::{
    BackoffPolicy, ErrorCategory, ErrorClassifier, ScoringStrategy, TransportScore,
    WindowedReliability,
};

fn category() -> impl Strategy<Value = ErrorCategory> {
    prop_oneof![
        Just(ErrorCategory::DeepPacketInspection),
        Just(ErrorCategory::PortBlock),
        Just(ErrorCategory::DnsFiltering),
        Just(ErrorCategory::ProxyRequired),
        Just(ErrorCategory::SslInspection),
        Just(ErrorCategory::BandwidthThrottling),
        Just(ErrorCategory::GeoBlocking),
        Just(ErrorCategory::ApplicationBlock),
        Just(ErrorCategory::Unknown),
    ]
}

proptest! {
    #[test]
    fn ema_stays_in_unit_interval(start in 0.0f64..=1.0, outcomes in prop::collection::vec(any::<bool>(), 0..200)) {
        let mut rate = start;
        for ok in outcomes {
            rate = ema_update(rate, ok);
            prop_assert!((0.0..=1.0).contains(&rate));
        }
    }

    #[test]
    fn scores_stay_bounded(outcomes in prop::collection::vec((any::<bool>(), 0u64..60_000), 0..100)) {
        let mut score = TransportScore::new("x");
        for (ok, ms) in outcomes {
            if ok {
                score.record_success(Duration::from_millis(ms));
            } else {
                score.record_failure(ErrorCategory::Unknown);
            }
        }
        let rate = WindowedReliability.success_rate(&score);
        let reliability = WindowedReliability.reliability(&score);
        prop_assert!((0.0..=1.0).contains(&rate));
        prop_assert!((0.0..=1.0).contains(&reliability));
        prop_assert!(score.window_len() <= 20);
    }

    #[test]
    fn backoff_never_exceeds_max(
        attempt in 0u32..100,
        cat in category(),
        restrictive in any::<bool>(),
        jitter in 0.0f64..2.0,
        unit in -1.0f64..=1.0,
    ) {
        let policy = BackoffPolicy { jitter, ..BackoffPolicy::default() };
        let base = policy.base_delay(attempt, cat, restrictive);
        let delay = policy.delay_with_unit(attempt, cat, restrictive, unit);
        prop_assert!(delay <= policy.max);
        // Jitter stays within the clamped fraction of the unjittered delay
        let spread = base.as_secs_f64() * 0.4 + 1e-6;
        prop_assert!((delay.as_secs_f64() - base.as_secs_f64()).abs() <= spread);
        prop_assert!(policy.delay(attempt, cat, restrictive) <= policy.max);
    }

    #[test]
    fn ranking_respects_reliability_then_priority(
        raw in prop::collection::vec((0u8..5, -100i32..100), 1..12)
    ) {
        let names: Vec<String> = (0..raw.len()).map(|i| format!("t{i}")).collect();
        let entries: Vec<RankEntry<'_>> = raw
            .iter()
            .zip(&names)
            .map(|((r, p), name)| RankEntry { name: name.as_str(), priority: *p, reliability: f64::from(*r) / 4.0 })
            .collect();
        let order = rank(&entries, None);

        let mut sorted = order.clone();
        sorted.sort_unstable();
        prop_assert_eq!(sorted, (0..entries.len()).collect::<Vec<_>>());
        for pair in order.windows(2) {
            let (a, b) = (&entries[pair[0]], &entries[pair[1]]);
            prop_assert!(a.reliability >= b.reliability);
            if a.reliability == b.reliability {
                prop_assert!(a.priority > b.priority || (a.priority == b.priority && pair[0] < pair[1]));
            }
        }
    }

    #[test]
    fn classifier_is_deterministic(text in ".{0,80}") {
        let classifier = ErrorClassifier::new();
        prop_assert_eq!(classifier.classify(&text), classifier.classify(&text));
    }
}
