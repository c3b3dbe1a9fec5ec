//! Shroud client core
//!
//! A consistent, low-latency local view of encrypted conversation state:
//! the expensive work (cryptography, persistence, network writes) happens
//! off the interactive path while callers observe effects immediately.
//!
//! # Components
//!
//! - [`KeyCache`]: keyed, single-flight, time-bounded cache for
//!   conversation keys
//! - [`CryptoWorker`]: AEAD encrypt/decrypt on a dedicated task, reached
//!   only by message passing with correlation ids
//! - [`StatusReconciler`]: optimistic per-message delivery status with
//!   background confirmation, retry, and rollback
//! - [`MessagePipeline`]: composition root wiring the three into the
//!   send/receive paths
//!
//! Everything is generic over an [`Environment`] so tests drive time,
//! timeouts, and backoff deterministically.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod env;
pub mod key_cache;
pub mod pipeline;
pub mod reconcile;
pub mod worker;

pub use env::{Environment, SystemEnv};
pub use key_cache::{CacheConfig, CacheStats, KeyCache, KeyCacheError, KeyFetchError};
pub use pipeline::{KeySource, MessagePipeline, PipelineConfig, PipelineError};
pub use reconcile::{
    MessageStatus, ReconcileError, RetryPolicy, StatusEvent, StatusReconciler, StatusStore,
    StatusStoreError,
};
pub use worker::{CryptoWorker, WorkerConfig, WorkerError};
