//! End-to-end runs of the controller over scripted sources

mod common;

use common::{items, no_backoff_policy, Harness, RecordingHandoff, ScriptedSource, Step};
use harvest_ingest::fetch::Jitter;
use harvest_ingest::ledger::{Ledger, LedgerError};
use harvest_ingest::RunSettings;
use harvest_ingest::rate_limit::{RateLimitConfig, RateLimiter};
use harvest_ingest::retry::{BackoffPolicy, FailureKind};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn rows(pairs: &[(&str, bool)]) -> Vec<(String, bool)> {
    pairs.iter().map(|(k, p)| (k.to_string(), *p)).collect()
}

// ============================================================================
// Full Runs
// ============================================================================

#[tokio::test]
async fn test_mixed_outcomes_under_rate_limit() {
    let source = ScriptedSource::new()
        .script("D", &[Step::Retryable, Step::Retryable, Step::Succeed])
        .script("E", &[Step::Fatal]);
    let harness = Harness::new(source);
    let limiter = RateLimiter::new(RateLimitConfig::new(2)).unwrap();
    let policy = BackoffPolicy {
        max_retries: 3,
        initial_backoff: Duration::from_millis(100),
        backoff_factor: 2.0,
        max_backoff: Duration::from_secs(120),
    };
    let controller = harness.controller(limiter, policy, 4, 5);

    let started = Instant::now();
    let report = controller
        .run(&items(&["A", "B", "C", "D", "E"]), &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(
        harness.ledger_rows(),
        rows(&[("A", true), ("B", true), ("C", true), ("D", true), ("E", false)])
    );

    assert_eq!(report.total, 5);
    assert_eq!(report.processed, 4);
    assert_eq!(report.succeeded, 4);
    assert!(report.has_failures());
    assert!(!report.interrupted);
    assert_eq!(report.failed.len(), 1);
    let (key, failure) = &report.failed[0];
    assert_eq!(key.as_str(), "E");
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(failure.attempts, 1);
    assert!(failure.reason.contains("no filings for E"));

    assert_eq!(harness.source.attempts("D"), 3);
    assert_eq!(harness.source.attempts("E"), 1);
    assert_eq!(harness.source.total_attempts(), 7);

    // Seven admissions at 2/s: the first is immediate, six are spaced 500ms
    assert!(elapsed >= Duration::from_millis(2_900), "elapsed {elapsed:?}");

    let mut delivered = harness.handoff.delivered();
    delivered.sort();
    assert_eq!(delivered, ["A", "B", "C", "D"]);
}

#[tokio::test]
async fn test_waves_persist_progress_and_report_percentage() {
    let harness = Harness::new(ScriptedSource::new());
    let controller = harness.controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 2);

    let universe = items(&["A", "B", "C", "D", "E"]);
    let report = controller.run(&universe, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.waves, 3);
    assert_eq!(report.progress().to_string(), "5/5 (100.00%)");
    assert!(!report.has_failures());
    assert!(harness.ledger_rows().iter().all(|(_, processed)| *processed));
}

#[tokio::test(start_paused = true)]
async fn test_waves_are_separated_by_pause() {
    let harness = Harness::new(ScriptedSource::new());
    let pause = Duration::from_secs(2);
    let controller = harness.paced_controller(
        RateLimiter::unthrottled(),
        no_backoff_policy(3),
        2,
        RunSettings {
            wave_size: 2,
            wave_pause: Jitter::new(pause, pause),
        },
    );

    let started = tokio::time::Instant::now();
    let report = controller
        .run(&items(&["A", "B", "C", "D"]), &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.waves, 2);
    assert_eq!(report.succeeded, 4);
    // One pause between two waves, none after the last
    assert!(elapsed >= pause, "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_wave_pause() {
    let harness = Harness::new(ScriptedSource::new());
    let pause = Duration::from_secs(2);
    let controller = harness.paced_controller(
        RateLimiter::unthrottled(),
        no_backoff_policy(3),
        2,
        RunSettings {
            wave_size: 2,
            wave_pause: Jitter::new(pause, pause),
        },
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let report = controller.run(&items(&["A", "B", "C", "D"]), &cancel).await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.waves, 1);
    assert_eq!(
        harness.ledger_rows(),
        rows(&[("A", true), ("B", true), ("C", false), ("D", false)])
    );
    assert_eq!(harness.source.attempts("C"), 0);
}

#[tokio::test]
async fn test_duplicate_work_items_dispatched_once() {
    let harness = Harness::new(ScriptedSource::new());
    let controller = harness.controller(RateLimiter::unthrottled(), no_backoff_policy(3), 4, 10);

    let report = controller
        .run(&items(&["A", "B", "A", "A"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(harness.source.attempts("A"), 1);
    assert_eq!(harness.ledger_rows(), rows(&[("A", true), ("B", true)]));
}

// ============================================================================
// Resumption
// ============================================================================

#[tokio::test]
async fn test_resumes_from_persisted_ledger() {
    let harness = Harness::new(ScriptedSource::new());
    let universe = items(&["A", "B", "C", "D", "E", "F"]);

    // State left by a process killed after its first wave was persisted
    let mut ledger = Ledger::seed(universe.iter().map(|item| item.key.clone()));
    ledger.mark_processed(&[universe[0].key.clone(), universe[1].key.clone()]);
    harness.ledger_store().persist(&ledger).unwrap();

    // ... and an attempt it never finished
    let abandoned = harness.documents_root().join(".staging/C-abc123");
    std::fs::create_dir_all(&abandoned).unwrap();
    std::fs::write(abandoned.join("partial.txt"), b"half").unwrap();

    let controller = harness.controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 2);
    let report = controller.run(&universe, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.succeeded, 4);
    assert!(!abandoned.exists());
    assert_eq!(harness.source.attempts("A"), 0);
    assert_eq!(harness.source.attempts("B"), 0);
    for key in ["C", "D", "E", "F"] {
        assert_eq!(harness.source.attempts(key), 1, "entity {key}");
    }
}

#[tokio::test]
async fn test_failed_entities_are_retried_on_next_run_only() {
    let source = ScriptedSource::new().script("B", &[Step::Fatal, Step::Succeed]);
    let harness = Harness::new(source);
    let universe = items(&["A", "B", "C"]);

    let first = harness
        .controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 10)
        .run(&universe, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.failed.len(), 1);
    assert_eq!(harness.source.attempts("B"), 1);
    assert_eq!(harness.ledger_rows(), rows(&[("A", true), ("B", false), ("C", true)]));

    let second = harness
        .controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 10)
        .run(&universe, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!second.has_failures());
    assert_eq!(second.succeeded, 1);
    assert_eq!(harness.source.attempts("A"), 1);
    assert_eq!(harness.source.attempts("B"), 2);

    // A completed universe dispatches nothing
    let third = harness
        .controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 10)
        .run(&universe, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(third.waves, 0);
    assert_eq!(harness.source.total_attempts(), 4);
}

#[tokio::test]
async fn test_refused_handoff_leaves_entity_pending() {
    let harness = Harness::with_handoff(ScriptedSource::new(), RecordingHandoff::refusing(&["B"]));
    let controller = harness.controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 10);

    let report = controller
        .run(&items(&["A", "B"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].1.kind, FailureKind::Handoff);
    assert!(report.failed[0].1.reason.contains("consumer queue full"));
    assert_eq!(harness.ledger_rows(), rows(&[("A", true), ("B", false)]));
}

// ============================================================================
// Ledger Errors
// ============================================================================

#[tokio::test]
async fn test_corrupt_ledger_halts_before_fetching() {
    let harness = Harness::new(ScriptedSource::new());
    let path = harness.ledger_store().path().to_path_buf();
    std::fs::write(&path, "entity_key,processed\nA,yes please\n").unwrap();

    let controller = harness.controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 10);
    let err = controller
        .run(&items(&["A"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Corrupt { .. }), "got {err:?}");
    assert_eq!(harness.source.total_attempts(), 0);
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "entity_key,processed\nA,yes please\n"
    );
}

#[tokio::test]
async fn test_ledger_for_other_universe_is_rejected() {
    let harness = Harness::new(ScriptedSource::new());
    harness
        .ledger_store()
        .persist(&Ledger::seed(items(&["A", "B"]).into_iter().map(|i| i.key)))
        .unwrap();

    let controller = harness.controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 10);
    let err = controller
        .run(&items(&["A", "Z"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::UniverseMismatch { .. }), "got {err:?}");
    assert_eq!(harness.source.total_attempts(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancelled_run_seeds_ledger_and_stops() {
    let harness = Harness::new(ScriptedSource::new());
    let controller = harness.controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 10);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = controller.run(&items(&["A", "B"]), &cancel).await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.waves, 0);
    assert_eq!(harness.source.total_attempts(), 0);
    assert_eq!(harness.ledger_rows(), rows(&[("A", false), ("B", false)]));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_run_keeps_completed_work() {
    let keys = ["A", "B", "C", "D", "E", "F"];
    let source = ScriptedSource::new().delay_all(&keys, Duration::from_secs(1));
    let harness = Harness::new(source);
    let controller = harness.controller(RateLimiter::unthrottled(), no_backoff_policy(3), 2, 2);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        // Lands while the second wave is in flight
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        trigger.cancel();
    });

    let report = controller.run(&items(&keys), &cancel).await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.waves, 2);
    assert_eq!(
        harness.ledger_rows(),
        rows(&[
            ("A", true),
            ("B", true),
            ("C", true),
            ("D", true),
            ("E", false),
            ("F", false)
        ])
    );
    assert_eq!(harness.source.attempts("E"), 0);
}
