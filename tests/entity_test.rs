//! Tests for entity namespacing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chain_query::{Entity, KeyPart, Producer, QueryManager, QueryOptions, key, producer};

// =========================================================================
// Helpers
// =========================================================================

fn counting(calls: &Arc<AtomicU32>, value: u32) -> impl Producer<u32> {
    let calls = Arc::clone(calls);
    producer::once(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(value) }
    })
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

// =========================================================================
// Key composition
// =========================================================================

#[test]
fn full_key_is_prefix_then_local() {
    let pool = Entity::new(QueryManager::with_defaults(), key!["pool", 7]);
    assert_eq!(pool.key(&key!["nav"]), key!["pool", 7, "nav"]);
    assert_eq!(pool.key(&key![]), key!["pool", 7]);
}

#[test]
fn child_extends_prefix() {
    let pool = Entity::new(QueryManager::with_defaults(), key!["evm", 1]);
    let share_class = pool.child(key!["pool", 7]).child_part("sc-0x01");
    assert_eq!(share_class.prefix(), &key!["evm", 1, "pool", 7, "sc-0x01"]);
    assert_eq!(
        share_class.prefix().parts().last(),
        Some(&KeyPart::from("sc-0x01"))
    );
}

// =========================================================================
// Isolation
// =========================================================================

#[tokio::test]
async fn same_local_key_under_different_prefixes_does_not_collide() {
    let manager = QueryManager::with_defaults();
    let pool_a = Entity::new(manager.clone(), key!["pool", 1]);
    let pool_b = Entity::new(manager.clone(), key!["pool", 2]);
    let calls = Arc::new(AtomicU32::new(0));

    let a = pool_a
        .query(Some(key!["nav"]), counting(&calls, 100), &QueryOptions::default())
        .unwrap();
    let b = pool_b
        .query(Some(key!["nav"]), counting(&calls, 200), &QueryOptions::default())
        .unwrap();

    assert_eq!(a.get().await, Ok(100));
    assert_eq!(b.get().await, Ok(200));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(manager.contains(&key!["pool", 1, "nav"]));
    assert!(manager.contains(&key!["pool", 2, "nav"]));
}

#[tokio::test]
async fn same_prefix_and_local_key_shares_entry() {
    let manager = QueryManager::with_defaults();
    let first = Entity::new(manager.clone(), key!["pool", 1]);
    let second = Entity::new(manager.clone(), key!["pool", 1]);
    let calls = Arc::new(AtomicU32::new(0));

    let a = first
        .query(Some(key!["nav"]), counting(&calls, 1), &QueryOptions::default())
        .unwrap();
    let b = second
        .query(Some(key!["nav"]), counting(&calls, 2), &QueryOptions::default())
        .unwrap();

    assert_eq!(a.get().await, Ok(1));
    // Inside the replay window, so the first producer's value wins.
    assert_eq!(b.get().await, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn absent_local_key_bypasses_cache() {
    let manager = QueryManager::with_defaults();
    let pool = Entity::new(manager.clone(), key!["pool", 1]);
    let calls = Arc::new(AtomicU32::new(0));

    let q = pool
        .query(None, counting(&calls, 5), &QueryOptions::default())
        .unwrap();
    assert!(!q.is_cached());
    assert_eq!(q.get().await, Ok(5));
    assert_eq!(q.get().await, Ok(5));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(manager.is_empty());
}

// =========================================================================
// Invalidation
// =========================================================================

#[tokio::test(start_paused = true)]
async fn invalidate_sweeps_entity_and_children_only() {
    let manager = QueryManager::with_defaults();
    let pool = Entity::new(manager.clone(), key!["pool", 1]);
    let share_class = pool.child_part("sc-a");
    let other = Entity::new(manager.clone(), key!["pool", 10]);
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new().observable_cache_time(Duration::from_secs(60));

    for q in [
        pool.query(Some(key!["nav"]), counting(&calls, 1), &options).unwrap(),
        share_class.query(Some(key!["price"]), counting(&calls, 2), &options).unwrap(),
        other.query(Some(key!["nav"]), counting(&calls, 3), &options).unwrap(),
    ] {
        q.get().await.unwrap();
    }
    settle().await;
    assert_eq!(manager.len(), 3);

    // `["pool", 10]` does not start with `["pool", 1]`.
    assert_eq!(pool.invalidate(), 2);
    assert_eq!(manager.len(), 1);
    assert!(manager.contains(&key!["pool", 10, "nav"]));
}
