//! Single-flight and eviction behavior of the key cache.
//!
//! These tests verify the concurrency contract that unit tests cannot:
//! concurrent getters coalesce onto one retrieval, failures propagate to
//! every waiter of the failed episode, and the default limits (1 hour TTL,
//! 100-entry capacity) behave at their boundaries under a virtual clock.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use shroud_core::{CacheConfig, Environment, KeyCache, KeyCacheError, KeyFetchError};
use shroud_crypto::{ConversationKey, KEY_SIZE};

#[derive(Clone)]
struct TestEnv;

impl Environment for TestEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(0x11);
    }

    fn wall_clock_millis(&self) -> u64 {
        0
    }
}

fn key(fill: u8) -> ConversationKey {
    ConversationKey::from_bytes([fill; KEY_SIZE])
}

#[tokio::test(start_paused = true)]
async fn five_concurrent_getters_share_one_retrieval() {
    let cache = KeyCache::new(TestEnv, CacheConfig::default());
    let env = TestEnv;
    let retrievals = Arc::new(AtomicUsize::new(0));

    let get = |_: usize| {
        let cache = cache.clone();
        let env = env.clone();
        let retrievals = Arc::clone(&retrievals);
        async move {
            cache
                .get("c1", move || async move {
                    retrievals.fetch_add(1, Ordering::SeqCst);
                    // The retrieval is slow; every other getter arrives
                    // while it is still in flight.
                    env.sleep(Duration::from_millis(100)).await;
                    Ok(key(42))
                })
                .await
        }
    };

    let (a, b, c, d, e) = tokio::join!(get(0), get(1), get(2), get(3), get(4));

    assert_eq!(retrievals.load(Ordering::SeqCst), 1, "retrieval must run exactly once");
    for result in [a, b, c, d, e] {
        assert_eq!(result.unwrap().as_bytes(), &[42; KEY_SIZE]);
    }

    let stats = cache.stats();
    assert_eq!(stats.occupancy, 1);
    assert_eq!(stats.misses, 5, "all five arrived before the fetch settled");
}

#[tokio::test(start_paused = true)]
async fn failure_propagates_to_every_waiter_and_caches_nothing() {
    let cache = KeyCache::new(TestEnv, CacheConfig::default());
    let env = TestEnv;
    let retrievals = Arc::new(AtomicUsize::new(0));

    let get = || {
        let cache = cache.clone();
        let env = env.clone();
        let retrievals = Arc::clone(&retrievals);
        async move {
            cache
                .get("c1", move || async move {
                    retrievals.fetch_add(1, Ordering::SeqCst);
                    env.sleep(Duration::from_millis(100)).await;
                    Err(KeyFetchError::Unavailable { reason: "service down".to_string() })
                })
                .await
        }
    };

    let (a, b, c) = tokio::join!(get(), get(), get());

    assert_eq!(retrievals.load(Ordering::SeqCst), 1);
    for result in [a, b, c] {
        assert!(matches!(result, Err(KeyCacheError::Fetch(KeyFetchError::Unavailable { .. }))));
    }
    assert_eq!(cache.stats().occupancy, 0, "failures are never cached");

    // The episode ended; a later get starts a fresh one and can succeed.
    let recovered = cache
        .get("c1", || async {
            Ok(key(7))
        })
        .await
        .unwrap();
    assert_eq!(recovered.as_bytes(), &[7; KEY_SIZE]);
    assert_eq!(retrievals.load(Ordering::SeqCst), 1, "recovery used a different retrieval");
}

#[tokio::test(start_paused = true)]
async fn sequential_gets_after_settling_hit_the_cache() {
    let cache = KeyCache::new(TestEnv, CacheConfig::default());
    let retrievals = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let retrievals = Arc::clone(&retrievals);
        let fetched = cache
            .get("c1", move || async move {
                retrievals.fetch_add(1, Ordering::SeqCst);
                Ok(key(9))
            })
            .await
            .unwrap();
        assert_eq!(fetched.as_bytes(), &[9; KEY_SIZE]);
    }

    assert_eq!(retrievals.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().hits, 4);
}

#[tokio::test(start_paused = true)]
async fn entries_expire_exactly_at_the_ttl() {
    let cache = KeyCache::new(TestEnv, CacheConfig::default());

    cache.get("c1", || async { Ok(key(1)) }).await.unwrap();

    // One tick under an hour: still served.
    tokio::time::advance(Duration::from_secs(3600) - Duration::from_millis(1)).await;
    let hit = cache.get("c1", || async { Ok(key(2)) }).await.unwrap();
    assert_eq!(hit.as_bytes(), &[1; KEY_SIZE]);

    // Crossing the boundary: treated as absent and refetched.
    tokio::time::advance(Duration::from_millis(1)).await;
    let refetched = cache.get("c1", || async { Ok(key(3)) }).await.unwrap();
    assert_eq!(refetched.as_bytes(), &[3; KEY_SIZE]);
}

#[tokio::test(start_paused = true)]
async fn the_101st_insert_evicts_exactly_the_least_recently_accessed() {
    let cache = KeyCache::new(TestEnv, CacheConfig::default());

    for i in 0..100 {
        cache.get(&format!("c{i}"), || async { Ok(key(1)) }).await.unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
    }
    assert_eq!(cache.stats().occupancy, 100);

    // Touch c0 so the least recently accessed entry becomes c1.
    cache.get("c0", || async { panic!("c0 must be cached") }).await.unwrap();
    tokio::time::advance(Duration::from_millis(1)).await;

    cache.get("c100", || async { Ok(key(2)) }).await.unwrap();
    assert_eq!(cache.stats().occupancy, 100, "exactly one entry was evicted");

    // c1 is the only casualty. It is probed last because refetching it
    // evicts another entry in turn.
    let refetched = Arc::new(AtomicUsize::new(0));
    for i in [0usize, 2, 50, 99, 100, 1] {
        let refetched = Arc::clone(&refetched);
        cache
            .get(&format!("c{i}"), move || async move {
                refetched.fetch_add(1, Ordering::SeqCst);
                Ok(key(9))
            })
            .await
            .unwrap();
    }
    assert_eq!(refetched.load(Ordering::SeqCst), 1, "only c1 needed refetching");
}

#[tokio::test(start_paused = true)]
async fn sweeper_task_purges_idle_entries() {
    let cache = KeyCache::new(
        TestEnv,
        CacheConfig { ttl: Duration::from_secs(60), capacity: 100 },
    );

    cache.get("c1", || async { Ok(key(1)) }).await.unwrap();

    let sweeper = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.run_sweeper(Duration::from_secs(30)).await })
    };

    // Let the spawned sweeper start and register its first sleep timer
    // before the virtual clock jumps; otherwise the advance fires no timer.
    tokio::task::yield_now().await;

    tokio::time::advance(Duration::from_secs(95)).await;
    tokio::task::yield_now().await;

    assert_eq!(cache.stats().occupancy, 0, "sweeper removed the expired entry");
    sweeper.abort();
}

#[tokio::test(start_paused = true)]
async fn preload_coalesces_with_concurrent_getters() {
    let cache = KeyCache::new(TestEnv, CacheConfig::default());
    let env = TestEnv;
    let retrievals = Arc::new(AtomicUsize::new(0));

    let preload = {
        let cache = cache.clone();
        let env = env.clone();
        let retrievals = Arc::clone(&retrievals);
        async move {
            cache
                .preload(&["c1".to_string(), "c2".to_string()], move |_| {
                    let env = env.clone();
                    let retrievals = Arc::clone(&retrievals);
                    async move {
                        retrievals.fetch_add(1, Ordering::SeqCst);
                        env.sleep(Duration::from_millis(50)).await;
                        Ok(key(5))
                    }
                })
                .await;
        }
    };

    let direct = {
        let cache = cache.clone();
        let env = env.clone();
        let retrievals = Arc::clone(&retrievals);
        async move {
            cache
                .get("c1", move || async move {
                    retrievals.fetch_add(1, Ordering::SeqCst);
                    env.sleep(Duration::from_millis(50)).await;
                    Ok(key(5))
                })
                .await
        }
    };

    let ((), direct_result) = tokio::join!(preload, direct);

    direct_result.unwrap();
    assert_eq!(
        retrievals.load(Ordering::SeqCst),
        2,
        "one fetch per conversation, shared between preload and get"
    );
    assert_eq!(cache.stats().occupancy, 2);
}
