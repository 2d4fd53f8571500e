//! Orchestrator behavior against scripted transports.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use sluice_failover::{
    AdaptiveOrchestrator, ErrorCategory, FailoverError, NetworkRestriction, Outcome,
    RestrictionKind, Severity, SkipReason, StatusEvent, TransportScore,
};

const REFUSED: &str = "connect to 10.0.0.7:9009 failed: Connection refused (os error 111)";

/// Three transports seeded with learned rates 0.9 / 0.5 / 0.1.
fn seeded_scores() -> Vec<TransportScore> {
    vec![
        TransportScore::new("alpha").with_base_rate(0.9),
        TransportScore::new("beta").with_base_rate(0.5),
        TransportScore::new("gamma").with_base_rate(0.1),
    ]
}

#[tokio::test(start_paused = true)]
async fn most_reliable_transport_is_tried_first() -> anyhow::Result<()> {
    init_tracing();
    let log = call_log();
    // Declared priorities point the other way; learned rates must win
    let orchestrator = AdaptiveOrchestrator::builder(config())
        .assessor(StaticAssessor::open())
        .scores(seeded_scores())
        .transport(ScriptedEndpoint::new("gamma", 90, &log))
        .transport(ScriptedEndpoint::new("beta", 50, &log))
        .transport(ScriptedEndpoint::new("alpha", 10, &log))
        .build()
        .await?;

    let outcome = orchestrator.send_with_failover(b"ciphertext", &meta()).await?;
    assert_eq!(outcome.transport, "alpha");
    assert_eq!(outcome.attempts, 1);
    assert_eq!(calls(&log), ["alpha"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn falls_through_in_reliability_order() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = AdaptiveOrchestrator::builder(config())
        .assessor(StaticAssessor::open())
        .scores(seeded_scores())
        .transport(ScriptedEndpoint::new("gamma", 90, &log))
        .transport(ScriptedEndpoint::new("beta", 50, &log).always(Step::Fail(REFUSED)))
        .transport(ScriptedEndpoint::new("alpha", 10, &log).always(Step::Fail(REFUSED)))
        .build()
        .await?;

    let outcome = orchestrator.send_with_failover(b"ciphertext", &meta()).await?;
    assert_eq!(outcome.transport, "gamma");
    assert_eq!(outcome.attempts, 3);
    // Port blocks are not retried on the same transport
    assert_eq!(calls(&log), ["alpha", "beta", "gamma"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn equal_scores_fall_back_to_priority() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("low", 10, &log).always(Step::Fail(REFUSED)),
            ScriptedEndpoint::new("high", 80, &log).always(Step::Fail(REFUSED)),
            ScriptedEndpoint::new("mid", 50, &log).always(Step::Fail(REFUSED)),
        ],
        StaticAssessor::open(),
    )
    .await?;

    let _ = orchestrator.send_with_failover(b"x", &meta()).await;
    assert_eq!(calls(&log), ["high", "mid", "low"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn all_refused_reports_port_block() -> anyhow::Result<()> {
    let log = call_log();
    let restriction = NetworkRestriction {
        kind: RestrictionKind::PortBlocking,
        description: "non-standard ports are blocked".into(),
        severity: Severity::High,
        workaround: "use a transport on port 443".into(),
        confidence: 0.8,
    };
    let orchestrator = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("alpha", 80, &log).always(Step::Fail(REFUSED)),
            ScriptedEndpoint::new("beta", 70, &log).always(Step::Fail(REFUSED)),
            ScriptedEndpoint::new("gamma", 60, &log).always(Step::Fail(REFUSED)),
        ],
        StaticAssessor::restrictive(vec![restriction.clone()]),
    )
    .await?;

    let err = orchestrator
        .send_with_failover(b"x", &meta())
        .await
        .unwrap_err();
    match &err {
        FailoverError::Exhausted {
            attempts,
            category,
            suggested_transports,
            last_error,
            restrictions,
            ..
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(*category, ErrorCategory::PortBlock);
            assert!(!suggested_transports.is_empty());
            assert!(last_error.contains("Connection refused"), "{last_error}");
            assert_eq!(restrictions, &vec![restriction]);
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert!(err.to_string().contains("port-blocking (high)"), "{err}");
    Ok(())
}

#[tokio::test]
async fn cancel_during_backoff_returns_promptly() -> anyhow::Result<()> {
    let log = call_log();
    let (tx, mut rx) = status_channel();
    let mut config = config();
    config.backoff.base = Duration::from_secs(10);
    let orchestrator = Arc::new(
        AdaptiveOrchestrator::builder(config)
            .assessor(StaticAssessor::open())
            .status_sink(tx)
            .transport(ScriptedEndpoint::new("alpha", 80, &log).always(Step::Fail(REFUSED)))
            .transport(ScriptedEndpoint::new("beta", 70, &log).always(Step::Fail(REFUSED)))
            .build()
            .await?,
    );

    let sender = Arc::clone(&orchestrator);
    let transfer =
        tokio::spawn(async move { sender.send_with_failover(b"x", &meta()).await });

    wait_event(&mut rx, |e| matches!(e, StatusEvent::AttemptFailed { .. })).await;
    let cancelled_at = Instant::now();
    assert!(orchestrator.cancel());

    let result = transfer.await?;
    assert!(matches!(result, Err(FailoverError::Cancelled)), "{result:?}");
    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    assert_eq!(calls(&log), ["alpha"]);
    wait_event(&mut rx, |e| matches!(e, StatusEvent::Cancelled { .. })).await;
    assert!(!orchestrator.cancel(), "nothing left to cancel");
    Ok(())
}

#[tokio::test]
async fn concurrent_transfer_is_rejected() -> anyhow::Result<()> {
    let log = call_log();
    let (tx, mut rx) = status_channel();
    let orchestrator = Arc::new(
        AdaptiveOrchestrator::builder(config())
            .assessor(StaticAssessor::open())
            .status_sink(tx)
            .transport(ScriptedEndpoint::new("alpha", 80, &log).always(Step::Hang))
            .build()
            .await?,
    );

    let sender = Arc::clone(&orchestrator);
    let first = tokio::spawn(async move { sender.send_with_failover(b"x", &meta()).await });
    wait_event(&mut rx, |e| matches!(e, StatusEvent::AttemptStarted { .. })).await;
    assert!(orchestrator.is_transfer_active());

    let second = orchestrator.send_with_failover(b"y", &meta()).await;
    assert!(matches!(second, Err(FailoverError::AlreadyInProgress)), "{second:?}");

    assert!(orchestrator.cancel());
    assert!(matches!(first.await?, Err(FailoverError::Cancelled)));
    assert!(!orchestrator.is_transfer_active());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_transport_cools_down_then_returns() -> anyhow::Result<()> {
    let log = call_log();
    let (tx, mut rx) = status_channel();
    let orchestrator = AdaptiveOrchestrator::builder(config())
        .assessor(StaticAssessor::open())
        .status_sink(tx)
        .transport(
            ScriptedEndpoint::new("alpha", 80, &log)
                .then(Step::Fail(REFUSED))
                .always(Step::Ok),
        )
        .transport(
            ScriptedEndpoint::new("beta", 70, &log)
                .then(Step::Ok)
                .always(Step::Fail(REFUSED)),
        )
        .build()
        .await?;

    // alpha fails and starts cooling down; beta carries the transfer
    let outcome = orchestrator.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "beta");
    let status = orchestrator.transport_status().await;
    assert!(status["alpha"].cooling_down);
    assert_eq!(status["alpha"].last_category, Some(ErrorCategory::PortBlock));
    assert!(!status["beta"].cooling_down);

    // beta now ranks first and fails; alpha is still cooling down
    drain(&mut rx);
    let err = orchestrator.send_with_failover(b"x", &meta()).await.unwrap_err();
    assert!(matches!(err, FailoverError::Exhausted { attempts: 1, .. }), "{err:?}");
    let skipped = drain(&mut rx).into_iter().any(|e| {
        matches!(
            e,
            StatusEvent::TransportSkipped { ref transport, reason: SkipReason::CoolingDown, .. }
                if transport == "alpha"
        )
    });
    assert!(skipped);

    // Once the cooldown window has passed alpha is eligible again
    tokio::time::advance(config().cooldown).await;
    let outcome = orchestrator.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "alpha");
    assert_eq!(calls(&log), ["alpha", "beta", "beta", "beta", "alpha"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn top_ranked_transport_bypasses_cooldown_once() -> anyhow::Result<()> {
    let log = call_log();
    let (tx, mut rx) = status_channel();
    let orchestrator = AdaptiveOrchestrator::builder(config())
        .assessor(StaticAssessor::open())
        .status_sink(tx)
        .transport(
            ScriptedEndpoint::new("alpha", 80, &log)
                .then(Step::Fail(REFUSED))
                .then(Step::Fail(REFUSED))
                .always(Step::Ok),
        )
        .build()
        .await?;

    assert!(orchestrator.send_with_failover(b"x", &meta()).await.is_err());
    assert!(orchestrator.transport_status().await["alpha"].cooling_down);

    // Still cooling down, but ranked first: tried once anyway
    let err = orchestrator.send_with_failover(b"x", &meta()).await.unwrap_err();
    assert!(matches!(err, FailoverError::Exhausted { attempts: 1, .. }), "{err:?}");
    assert_eq!(calls(&log), ["alpha", "alpha"]);

    // The bypass is spent for this session
    drain(&mut rx);
    let err = orchestrator.send_with_failover(b"x", &meta()).await.unwrap_err();
    assert!(matches!(err, FailoverError::Exhausted { attempts: 0, .. }), "{err:?}");
    assert!(err.to_string().contains("no transport was available"), "{err}");
    let skipped = drain(&mut rx).into_iter().any(|e| {
        matches!(
            e,
            StatusEvent::TransportSkipped { ref transport, reason: SkipReason::CoolingDown, .. }
                if transport == "alpha"
        )
    });
    assert!(skipped);
    assert_eq!(calls(&log), ["alpha", "alpha"]);

    tokio::time::advance(config().cooldown).await;
    let outcome = orchestrator.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "alpha");
    assert_eq!(calls(&log), ["alpha", "alpha", "alpha"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_same_transport() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("alpha", 80, &log)
                .then(Step::Fail("429 Too Many Requests"))
                .always(Step::Ok),
            ScriptedEndpoint::new("beta", 70, &log),
        ],
        StaticAssessor::open(),
    )
    .await?;

    let outcome = orchestrator.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "alpha");
    assert_eq!(outcome.attempts, 2);
    assert_eq!(calls(&log), ["alpha", "alpha"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hung_attempt_times_out_and_fails_over() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("alpha", 80, &log).always(Step::Hang),
            ScriptedEndpoint::new("beta", 70, &log),
        ],
        StaticAssessor::open(),
    )
    .await?;

    let outcome = orchestrator.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "beta");
    // Timeouts classify as throttling: retried up to three times
    assert_eq!(calls(&log), ["alpha", "alpha", "alpha", "beta"]);
    let status = orchestrator.transport_status().await;
    assert_eq!(
        status["alpha"].last_category,
        Some(ErrorCategory::BandwidthThrottling)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn panicking_transport_is_a_classified_failure() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("alpha", 80, &log).always(Step::Panic),
            ScriptedEndpoint::new("beta", 70, &log),
        ],
        StaticAssessor::open(),
    )
    .await?;

    let outcome = orchestrator.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "beta");
    let status = orchestrator.transport_status().await;
    assert_eq!(status["alpha"].last_category, Some(ErrorCategory::Unknown));
    assert!(status["alpha"].failures >= 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unavailable_transports_are_skipped() -> anyhow::Result<()> {
    let log = call_log();
    let (tx, mut rx) = status_channel();
    let orchestrator = AdaptiveOrchestrator::builder(config())
        .assessor(StaticAssessor::open())
        .status_sink(tx)
        .transport(ScriptedEndpoint::new("alpha", 90, &log).unavailable())
        .transport(ScriptedEndpoint::new("beta", 80, &log).slow_availability())
        .transport(ScriptedEndpoint::new("gamma", 70, &log))
        .build()
        .await?;

    let outcome = orchestrator.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "gamma");
    assert_eq!(outcome.attempts, 1);
    assert_eq!(calls(&log), ["gamma"]);

    let skipped: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            StatusEvent::TransportSkipped { transport, reason: SkipReason::Unavailable, .. } => {
                Some(transport)
            }
            _ => None,
        })
        .collect();
    assert_eq!(skipped, ["alpha", "beta"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn nothing_available_is_exhausted_without_attempts() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = orchestrator(
        config(),
        vec![ScriptedEndpoint::new("alpha", 90, &log).unavailable()],
        StaticAssessor::open(),
    )
    .await?;

    match orchestrator.send_with_failover(b"x", &meta()).await {
        Err(FailoverError::Exhausted {
            attempts,
            category,
            last_error,
            ..
        }) => {
            assert_eq!(attempts, 0);
            assert_eq!(category, ErrorCategory::Unknown);
            assert_eq!(last_error, "no transport was available");
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn receive_returns_payload() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("alpha", 80, &log).always(Step::Fail("HTTP 403 Forbidden")),
            ScriptedEndpoint::new("beta", 70, &log),
        ],
        StaticAssessor::open(),
    )
    .await?;

    let (data, outcome) = orchestrator.receive_with_failover(&meta()).await?;
    assert_eq!(data, b"scripted payload");
    assert_eq!(outcome.transport, "beta");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ledger_failure_does_not_fail_transfer() -> anyhow::Result<()> {
    init_tracing();
    let log = call_log();
    let ledger = Arc::new(common::MemoryLedger {
        fail: true,
        ..Default::default()
    });
    let orchestrator = AdaptiveOrchestrator::builder(config())
        .assessor(StaticAssessor::open())
        .ledger(ledger.clone())
        .transport(ScriptedEndpoint::new("alpha", 80, &log).always(Step::Fail(REFUSED)))
        .transport(ScriptedEndpoint::new("beta", 70, &log))
        .build()
        .await?;

    let meta = meta();
    let outcome = orchestrator.send_with_failover(b"ciphertext", &meta).await?;
    assert_eq!(outcome.transport, "beta");

    // Records are written in the background
    for _ in 0..100 {
        if ledger.records.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let records = ledger.records.lock().unwrap().clone();
    assert_eq!(records.len(), 2);
    let failure = records.iter().find(|r| r.transport == "alpha").unwrap();
    assert_eq!(failure.outcome, Outcome::Failure);
    assert_eq!(failure.category, Some(ErrorCategory::PortBlock));
    let success = records.iter().find(|r| r.transport == "beta").unwrap();
    assert_eq!(success.outcome, Outcome::Success);
    assert_eq!(success.bytes, 10);
    assert_eq!(success.transfer_id, meta.transfer_id);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn status_events_trace_the_transfer() -> anyhow::Result<()> {
    let log = call_log();
    let (tx, mut rx) = status_channel();
    let orchestrator = AdaptiveOrchestrator::builder(config())
        .assessor(StaticAssessor::open())
        .status_sink(tx)
        .transport(ScriptedEndpoint::new("alpha", 80, &log).always(Step::Fail(REFUSED)))
        .transport(ScriptedEndpoint::new("beta", 70, &log))
        .build()
        .await?;

    orchestrator.send_with_failover(b"x", &meta()).await?;
    let names: Vec<&'static str> = drain(&mut rx)
        .iter()
        .map(|e| match e {
            StatusEvent::ClassificationComplete { .. } => "classified",
            StatusEvent::AttemptStarted { .. } => "started",
            StatusEvent::AttemptFailed { .. } => "failed",
            StatusEvent::TransportSkipped { .. } => "skipped",
            StatusEvent::Succeeded { .. } => "succeeded",
            StatusEvent::Exhausted { .. } => "exhausted",
            StatusEvent::Cancelled { .. } => "cancelled",
        })
        .collect();
    assert_eq!(names, ["classified", "started", "failed", "started", "succeeded"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unclassified_network_prefers_firewall_friendly_transport() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("tcp-direct", 80, &log),
            ScriptedEndpoint::new("https-relay", 60, &log),
        ],
        StaticAssessor::stuck(),
    )
    .await?;

    // Waits out first_classification_wait, then assumes the worst
    let outcome = orchestrator.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "https-relay");
    let profile = orchestrator.network_profile().await;
    assert!(profile.is_restrictive);
    assert_eq!(profile.preferred_transport.as_deref(), Some("https-relay"));
    orchestrator.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refresh_and_profile_queries() -> anyhow::Result<()> {
    let log = call_log();
    let orchestrator = orchestrator(
        config(),
        vec![ScriptedEndpoint::new("alpha", 80, &log)],
        StaticAssessor::open(),
    )
    .await?;

    let profile = orchestrator.refresh_network_profile().await?;
    assert!(!profile.is_restrictive);
    assert_eq!(orchestrator.network_profile().await, profile);
    assert!(orchestrator.restrictions().await.is_empty());
    assert_eq!(orchestrator.network_quality().await, Some(9.0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn learned_scores_carry_over() -> anyhow::Result<()> {
    let log = call_log();
    let first = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("alpha", 80, &log).always(Step::Fail(REFUSED)),
            ScriptedEndpoint::new("beta", 70, &log),
        ],
        StaticAssessor::open(),
    )
    .await?;
    first.send_with_failover(b"x", &meta()).await?;
    let scores = first.scores().await;
    first.close().await?;

    let alpha = scores.iter().find(|s| s.name == "alpha").unwrap();
    assert_eq!(alpha.failures, 1);
    assert!(alpha.base_rate < 0.5);

    let log = call_log();
    let second = AdaptiveOrchestrator::builder(config())
        .assessor(StaticAssessor::open())
        .scores(scores)
        .transport(ScriptedEndpoint::new("alpha", 80, &log))
        .transport(ScriptedEndpoint::new("beta", 70, &log))
        .build()
        .await?;
    let outcome = second.send_with_failover(b"x", &meta()).await?;
    assert_eq!(outcome.transport, "beta");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn close_rejects_later_transfers() -> anyhow::Result<()> {
    let log = call_log();
    let endpoint = ScriptedEndpoint::new("alpha", 80, &log);
    let closed = endpoint.closed_flag();
    let orchestrator = orchestrator(config(), vec![endpoint], StaticAssessor::open()).await?;

    orchestrator.close().await?;
    orchestrator.close().await?;
    assert!(closed.load(Ordering::SeqCst));
    assert!(matches!(
        orchestrator.send_with_failover(b"x", &meta()).await,
        Err(FailoverError::Closed)
    ));
    assert!(matches!(
        orchestrator.refresh_network_profile().await,
        Err(FailoverError::Closed)
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn no_transports_and_duplicates() -> anyhow::Result<()> {
    let empty = orchestrator(config(), Vec::new(), StaticAssessor::open()).await?;
    assert!(matches!(
        empty.send_with_failover(b"x", &meta()).await,
        Err(FailoverError::NoTransports)
    ));

    let log = call_log();
    let duplicate = orchestrator(
        config(),
        vec![
            ScriptedEndpoint::new("alpha", 80, &log),
            ScriptedEndpoint::new("alpha", 70, &log),
        ],
        StaticAssessor::open(),
    )
    .await;
    let err = duplicate.unwrap_err().to_string();
    assert!(err.contains("duplicate transport name: alpha"), "{err}");
    Ok(())
}
