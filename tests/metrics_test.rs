//! Tests for metrics integration.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::future::Future;
use std::time::Duration;

use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

use chain_query::{QueryError, QueryManager, QueryOptions, key, producer, telemetry};

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Sum counter values for `name` carrying the label `label=value`.
fn counter_with_label(snapshot: &SnapshotVec, name: &str, label: &str, value: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| {
            key.kind() == MetricKind::Counter
                && key.key().name() == name
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == label && l.value() == value)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Runs async code within a local recorder scope.
///
/// Pipelines run in spawned tasks, so the work is driven by a
/// current-thread runtime owned by this thread: every task it spawns
/// records into the same local recorder.
fn record<F: Future>(fut: F) -> (F::Output, SnapshotVec) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let output = metrics::with_local_recorder(&recorder, || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
            .block_on(fut)
    });
    (output, snapshotter.snapshot().into_vec())
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn miss_then_hit() {
    let (_, snapshot) = record(async {
        let manager = QueryManager::with_defaults();
        let q = manager
            .acquire(
                Some(key!["pool", 1, "nav"]),
                producer::once(|| async { Ok(1u32) }),
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(q.get().await, Ok(1));
        assert_eq!(q.get().await, Ok(1));
    });

    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_HITS_TOTAL), 1);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::PRODUCER_INVOCATIONS_TOTAL, "cached", "true"),
        1
    );
}

#[test]
fn uncached_invocations_are_labelled() {
    let (_, snapshot) = record(async {
        let manager = QueryManager::with_defaults();
        let q = manager
            .acquire(None, producer::once(|| async { Ok(1u32) }), &QueryOptions::default())
            .unwrap();
        q.get().await.unwrap();
        q.get().await.unwrap();
    });

    assert_eq!(
        counter_with_label(&snapshot, telemetry::PRODUCER_INVOCATIONS_TOTAL, "cached", "false"),
        2
    );
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 0);
}

#[test]
fn producer_error_records_error_and_eviction() {
    let (_, snapshot) = record(async {
        let manager = QueryManager::with_defaults();
        let q = manager
            .acquire(
                Some(key!["pool", 1, "nav"]),
                producer::once(|| async { Err::<u32, _>(QueryError::producer("reverted")) }),
                &QueryOptions::default(),
            )
            .unwrap();
        assert!(q.get().await.is_err());
        settle().await;
    });

    assert_eq!(
        counter_with_label(&snapshot, telemetry::PRODUCER_ERRORS_TOTAL, "cached", "true"),
        1
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::EVICTIONS_TOTAL, "reason", "error"),
        1
    );
}

#[test]
fn idle_and_cleared_evictions() {
    let (_, snapshot) = record(async {
        let manager = QueryManager::with_defaults();
        let options = QueryOptions::new().observable_cache_time(Duration::from_millis(100));
        for id in 0..2 {
            let q = manager
                .acquire(Some(key!["pool", id]), producer::once(|| async { Ok(1u32) }), &options)
                .unwrap();
            q.get().await.unwrap();
        }
        settle().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
        assert!(manager.is_empty());

        let q = manager
            .acquire(Some(key!["pool", 9]), producer::once(|| async { Ok(1u32) }), &options)
            .unwrap();
        let _sub = q.subscribe();
        manager.clear();
    });

    assert_eq!(
        counter_with_label(&snapshot, telemetry::EVICTIONS_TOTAL, "reason", "idle"),
        2
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::EVICTIONS_TOTAL, "reason", "cleared"),
        1
    );
}

#[test]
fn invalidation_of_idle_entry_is_recorded() {
    let (_, snapshot) = record(async {
        let manager = QueryManager::with_defaults();
        let q = manager
            .acquire(
                Some(key!["pool", 1, "nav"]),
                producer::once(|| async { Ok(1u32) }),
                &QueryOptions::default(),
            )
            .unwrap();
        q.get().await.unwrap();
        assert!(manager.invalidate(&key!["pool", 1, "nav"]));
    });

    assert_eq!(
        counter_with_label(&snapshot, telemetry::EVICTIONS_TOTAL, "reason", "invalidated"),
        1
    );
}
