//! Environment abstraction for deterministic testing.
//!
//! Decouples the cache, worker, and reconciler from system resources (time,
//! randomness). Tests drive TTL expiry, request timeouts, and retry backoff
//! with a virtual clock; production uses real system resources via
//! [`SystemEnv`].

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
///   (it feeds AEAD nonces)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`; tests use
    /// `tokio::time::Instant` so paused-time runtimes control expiry and
    /// backoff deterministically.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - Subsequent calls must return times >= previous calls within a
    ///   single execution context.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Used for request timeouts, retry backoff, and the cache sweeper
    /// interval.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Cryptographically secure in production; AEAD nonces are drawn from
    ///   this source
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Milliseconds since the Unix epoch, for event timestamps.
    ///
    /// Unlike `now()`, this is wall-clock time: it is only used to stamp
    /// status events handed to the UI and carries no ordering guarantee.
    fn wall_clock_millis(&self) -> u64;
}

/// Production environment using system time and cryptographic RNG.
///
/// Uses `std::time::Instant::now()` for time, `tokio::time::sleep()` for
/// async sleeping, and getrandom for cryptographic randomness.
///
/// # Panics
///
/// Panics if the OS RNG fails. This is intentional - a client without
/// functioning cryptographic randomness cannot encrypt securely, and
/// continuing would compromise every nonce drawn afterwards. RNG failure is
/// extremely rare and indicates OS-level issues.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - client cannot encrypt securely");
    }

    #[allow(clippy::expect_used)]
    fn wall_clock_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_millis() as u64
    }
}
