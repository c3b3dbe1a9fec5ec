//! Single-flight conversation key cache.
//!
//! Returns a conversation's symmetric key quickly while minimizing calls to
//! the (expensive, possibly remote) key-retrieval collaborator. Concurrent
//! requests for the same conversation never trigger more than one retrieval:
//! the first miss starts a fetch episode, later callers attach as waiters,
//! and the settled result (key or error) is broadcast to every waiter.
//! Failures are never cached.
//!
//! Entries expire after a TTL (lazily on access, proactively via
//! [`KeyCache::sweep_expired`]) and the least-recently-accessed entry is
//! evicted when an insert would exceed capacity.
//!
//! # Invariants
//!
//! - At most one live cache entry per conversation id
//! - At most one pending fetch per conversation id at any instant
//! - A cache hit never suspends the caller
//! - Keys are returned by value (copy-out); an entry may be evicted while a
//!   previously returned copy is still in use

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shroud_crypto::ConversationKey;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::env::Environment;

/// Default time-to-live for cached keys.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Default maximum number of cached keys.
pub const DEFAULT_CAPACITY: usize = 100;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum age before a cached key is treated as absent.
    pub ttl: Duration,
    /// Maximum number of entries before LRU eviction kicks in.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL, capacity: DEFAULT_CAPACITY }
    }
}

/// Error from the external key-retrieval collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyFetchError {
    /// The key service could not be reached or answered with a server error.
    #[error("key service unavailable: {reason}")]
    Unavailable {
        /// Why the service was unavailable.
        reason: String,
    },

    /// The key service did not answer in time.
    #[error("key fetch timed out after {elapsed:?}")]
    Timeout {
        /// How long we waited.
        elapsed: Duration,
    },

    /// The service answered but has no key for this conversation.
    #[error("no key exists for conversation {conversation_id}")]
    UnknownConversation {
        /// Conversation that was requested.
        conversation_id: String,
    },
}

impl KeyFetchError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// An unknown conversation is not transient - asking again will not
    /// make the key exist.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Errors returned by [`KeyCache::get`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyCacheError {
    /// The retrieval collaborator failed; propagated to every waiter of the
    /// failed fetch episode.
    #[error(transparent)]
    Fetch(#[from] KeyFetchError),

    /// The caller leading the fetch episode was dropped before the
    /// retrieval settled. A later `get` starts a fresh episode.
    #[error("key fetch for conversation {conversation_id} was abandoned before settling")]
    FetchAbandoned {
        /// Conversation whose fetch was abandoned.
        conversation_id: String,
    },
}

/// Hit/miss counters and occupancy, for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Number of `get` calls served from the cache.
    pub hits: u64,
    /// Number of `get` calls that missed (expired entries count as misses).
    pub misses: u64,
    /// Current number of live entries.
    pub occupancy: usize,
}

struct CacheEntry<I> {
    key: ConversationKey,
    cached_at: I,
    last_access: I,
}

type Waiter = oneshot::Sender<Result<ConversationKey, KeyCacheError>>;

struct CacheState<I> {
    entries: HashMap<String, CacheEntry<I>>,
    pending: HashMap<String, Vec<Waiter>>,
    hits: u64,
    misses: u64,
}

impl<I> CacheState<I> {
    fn new() -> Self {
        Self { entries: HashMap::new(), pending: HashMap::new(), hits: 0, misses: 0 }
    }
}

/// Keyed, single-flight, time-bounded cache for conversation keys.
///
/// Clones are cheap handles sharing the same underlying cache, so one
/// instance constructed by the composition root can be handed to every
/// consumer.
pub struct KeyCache<E: Environment> {
    env: E,
    config: CacheConfig,
    state: Arc<Mutex<CacheState<E::Instant>>>,
}

impl<E: Environment> Clone for KeyCache<E> {
    fn clone(&self) -> Self {
        Self { env: self.env.clone(), config: self.config.clone(), state: Arc::clone(&self.state) }
    }
}

impl<E: Environment> KeyCache<E> {
    /// Create a cache with the given configuration.
    pub fn new(env: E, config: CacheConfig) -> Self {
        Self { env, config, state: Arc::new(Mutex::new(CacheState::new())) }
    }

    /// Fetch the key for a conversation, consulting the cache first.
    ///
    /// - Cache hit: returns immediately, never suspends.
    /// - Fetch already in flight: joins it as a waiter; `retrieve` is NOT
    ///   invoked.
    /// - Otherwise: invokes `retrieve` exactly once for this fetch episode
    ///   and broadcasts the settled result to all waiters. A failure
    ///   resolves every waiter with the error and caches nothing.
    pub async fn get<F, Fut>(
        &self,
        conversation_id: &str,
        retrieve: F,
    ) -> Result<ConversationKey, KeyCacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConversationKey, KeyFetchError>>,
    {
        let waiter = {
            let now = self.env.now();
            let mut guard = self.lock_state();
            let state = &mut *guard;

            if let Some(entry) = state.entries.get_mut(conversation_id) {
                if now - entry.cached_at < self.config.ttl {
                    entry.last_access = now;
                    state.hits += 1;
                    tracing::debug!(conversation_id, "key cache hit");
                    return Ok(entry.key.clone());
                }
                state.entries.remove(conversation_id);
                tracing::debug!(conversation_id, "key cache entry expired");
            }
            state.misses += 1;

            if let Some(waiters) = state.pending.get_mut(conversation_id) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                state.pending.insert(conversation_id.to_string(), Vec::new());
                None
            }
        };

        if let Some(rx) = waiter {
            tracing::debug!(conversation_id, "joining in-flight key fetch");
            return rx.await.unwrap_or_else(|_| {
                Err(KeyCacheError::FetchAbandoned { conversation_id: conversation_id.to_string() })
            });
        }

        // This caller leads the fetch episode. The guard resolves the
        // episode with an error if the future is dropped mid-retrieval.
        let guard = FetchGuard {
            state: Arc::clone(&self.state),
            conversation_id: conversation_id.to_string(),
            armed: true,
        };
        let result = retrieve().await.map_err(KeyCacheError::from);
        self.settle(guard, result)
    }

    /// Drop any cached entry for a conversation. No-op if absent.
    ///
    /// Used when key material is rotated or revoked upstream.
    pub fn invalidate(&self, conversation_id: &str) {
        let mut state = self.lock_state();
        if state.entries.remove(conversation_id).is_some() {
            tracing::debug!(conversation_id, "invalidated cached key");
        }
    }

    /// Warm the cache for conversations predicted to be accessed soon.
    ///
    /// Issues `get` concurrently for every id that is not already cached
    /// and awaits them all. Fetch failures are logged and swallowed - a
    /// failed warm-up just means the first real access pays the fetch.
    pub async fn preload<F, Fut>(&self, conversation_ids: &[String], retrieve: F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<ConversationKey, KeyFetchError>>,
    {
        let missing: Vec<String> = {
            let now = self.env.now();
            let state = self.lock_state();
            conversation_ids
                .iter()
                .filter(|id| {
                    state
                        .entries
                        .get(id.as_str())
                        .is_none_or(|entry| now - entry.cached_at >= self.config.ttl)
                })
                .cloned()
                .collect()
        };

        let retrieve = &retrieve;
        let fetches = missing.into_iter().map(|id| async move {
            if let Err(error) = self.get(&id, || retrieve(id.clone())).await {
                tracing::debug!(conversation_id = %id, %error, "cache warm-up fetch failed");
            }
        });
        futures::future::join_all(fetches).await;
    }

    /// Remove every expired entry. Returns the number removed.
    ///
    /// Expiry is also enforced lazily on access; this proactive pass exists
    /// so long-idle entries do not pin key material in memory for longer
    /// than the TTL.
    pub fn sweep_expired(&self) -> usize {
        let now = self.env.now();
        let mut state = self.lock_state();
        let before = state.entries.len();
        let ttl = self.config.ttl;
        state.entries.retain(|_, entry| now - entry.cached_at < ttl);
        let removed = before - state.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Periodic sweep loop; never returns. Spawn from the composition root.
    pub async fn run_sweeper(&self, interval: Duration) {
        loop {
            self.env.sleep(interval).await;
            self.sweep_expired();
        }
    }

    /// Current hit/miss counters and occupancy.
    ///
    /// Observability only; not part of the correctness contract.
    pub fn stats(&self) -> CacheStats {
        let state = self.lock_state();
        CacheStats { hits: state.hits, misses: state.misses, occupancy: state.entries.len() }
    }

    /// Settle a fetch episode: populate the cache on success, resolve all
    /// waiters with the result either way, and hand it to the leader.
    fn settle(
        &self,
        mut guard: FetchGuard<E::Instant>,
        result: Result<ConversationKey, KeyCacheError>,
    ) -> Result<ConversationKey, KeyCacheError> {
        guard.armed = false;
        let now = self.env.now();
        let mut state = self.lock_state();

        let waiters = state.pending.remove(&guard.conversation_id).unwrap_or_default();

        if let Ok(key) = &result {
            if state.entries.len() >= self.config.capacity {
                evict_least_recent(&mut state);
            }
            state.entries.insert(
                guard.conversation_id.clone(),
                CacheEntry { key: key.clone(), cached_at: now, last_access: now },
            );
        }

        for waiter in waiters {
            // A waiter that gave up awaiting is fine to ignore.
            let _ = waiter.send(result.clone());
        }
        result
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState<E::Instant>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Evict the single least-recently-accessed entry. Ties broken arbitrarily.
fn evict_least_recent<I: Copy + Ord>(state: &mut CacheState<I>) {
    let oldest = state
        .entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_access)
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        state.entries.remove(&id);
        tracing::debug!(conversation_id = %id, "evicted least-recently-used key");
    }
}

/// Clears the pending slot if the episode leader is dropped mid-fetch, so
/// waiters fail fast instead of hanging and a later `get` can start a new
/// episode.
struct FetchGuard<I> {
    state: Arc<Mutex<CacheState<I>>>,
    conversation_id: String,
    armed: bool,
}

impl<I> Drop for FetchGuard<I> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waiters) = state.pending.remove(&self.conversation_id) {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                waiters = waiters.len(),
                "fetch episode abandoned"
            );
            for waiter in waiters {
                let _ = waiter.send(Err(KeyCacheError::FetchAbandoned {
                    conversation_id: self.conversation_id.clone(),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shroud_crypto::KEY_SIZE;

    use super::*;

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
            buffer.fill(0x42);
        }

        fn wall_clock_millis(&self) -> u64 {
            0
        }
    }

    fn key(fill: u8) -> ConversationKey {
        ConversationKey::from_bytes([fill; KEY_SIZE])
    }

    fn cache(ttl_secs: u64, capacity: usize) -> KeyCache<TestEnv> {
        KeyCache::new(
            TestEnv,
            CacheConfig { ttl: Duration::from_secs(ttl_secs), capacity },
        )
    }

    #[tokio::test]
    async fn second_get_is_a_hit() {
        let cache = cache(3600, 100);

        let first = cache.get("c1", || async { Ok(key(1)) }).await.unwrap();
        let second = cache.get("c1", || async { panic!("must not retrieve on hit") }).await.unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.occupancy, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_treated_as_absent() {
        let cache = cache(3600, 100);

        cache.get("c1", || async { Ok(key(1)) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;

        let refetched = cache.get("c1", || async { Ok(key(2)) }).await.unwrap();
        assert_eq!(refetched.as_bytes(), &[2; KEY_SIZE]);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_just_under_ttl_is_still_served() {
        let cache = cache(3600, 100);

        cache.get("c1", || async { Ok(key(1)) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(3599)).await;

        let hit = cache.get("c1", || async { Ok(key(2)) }).await.unwrap();
        assert_eq!(hit.as_bytes(), &[1; KEY_SIZE]);
    }

    #[tokio::test(start_paused = true)]
    async fn overflowing_insert_evicts_least_recently_accessed() {
        let cache = cache(3600, 3);

        cache.get("c1", || async { Ok(key(1)) }).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.get("c2", || async { Ok(key(2)) }).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.get("c3", || async { Ok(key(3)) }).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;

        // Touch c1 so c2 becomes the least recently accessed.
        cache.get("c1", || async { Ok(key(9)) }).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;

        cache.get("c4", || async { Ok(key(4)) }).await.unwrap();

        assert_eq!(cache.stats().occupancy, 3);
        // c2 was evicted; c1, c3, c4 are hits.
        cache.get("c1", || async { panic!("c1 must be cached") }).await.unwrap();
        cache.get("c3", || async { panic!("c3 must be cached") }).await.unwrap();
        cache.get("c4", || async { panic!("c4 must be cached") }).await.unwrap();
        let refetched = cache.get("c2", || async { Ok(key(22)) }).await.unwrap();
        assert_eq!(refetched.as_bytes(), &[22; KEY_SIZE]);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let cache = cache(3600, 100);

        let result = cache
            .get("c1", || async {
                Err(KeyFetchError::Unavailable { reason: "boom".to_string() })
            })
            .await;
        assert!(matches!(result, Err(KeyCacheError::Fetch(KeyFetchError::Unavailable { .. }))));
        assert_eq!(cache.stats().occupancy, 0);

        // Next get starts a fresh episode and can succeed.
        let recovered = cache.get("c1", || async { Ok(key(5)) }).await.unwrap();
        assert_eq!(recovered.as_bytes(), &[5; KEY_SIZE]);
    }

    #[tokio::test]
    async fn invalidate_removes_entry_and_is_idempotent() {
        let cache = cache(3600, 100);

        cache.get("c1", || async { Ok(key(1)) }).await.unwrap();
        cache.invalidate("c1");
        cache.invalidate("c1");
        assert_eq!(cache.stats().occupancy, 0);

        let refetched = cache.get("c1", || async { Ok(key(2)) }).await.unwrap();
        assert_eq!(refetched.as_bytes(), &[2; KEY_SIZE]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let cache = cache(3600, 100);

        cache.get("old", || async { Ok(key(1)) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(1800)).await;
        cache.get("young", || async { Ok(key(2)) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(1800)).await;

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.stats().occupancy, 1);
        cache.get("young", || async { panic!("young must survive the sweep") }).await.unwrap();
    }

    #[tokio::test]
    async fn preload_skips_already_cached_ids() {
        let cache = cache(3600, 100);
        cache.get("c1", || async { Ok(key(1)) }).await.unwrap();

        let fetched = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let fetched_by = Arc::clone(&fetched);
        cache
            .preload(&["c1".to_string(), "c2".to_string()], move |id| {
                let fetched = Arc::clone(&fetched_by);
                async move {
                    fetched.lock().unwrap_or_else(PoisonError::into_inner).push(id);
                    Ok(key(7))
                }
            })
            .await;

        assert_eq!(&*fetched.lock().unwrap_or_else(PoisonError::into_inner), &["c2".to_string()]);
        assert_eq!(cache.stats().occupancy, 2);
    }

    #[tokio::test]
    async fn preload_survives_fetch_failures() {
        let cache = cache(3600, 100);

        cache
            .preload(&["c1".to_string(), "c2".to_string()], |id| async move {
                if id == "c1" {
                    Err(KeyFetchError::Unavailable { reason: "down".to_string() })
                } else {
                    Ok(key(2))
                }
            })
            .await;

        assert_eq!(cache.stats().occupancy, 1);
        cache.get("c2", || async { panic!("c2 must be cached") }).await.unwrap();
    }
}
