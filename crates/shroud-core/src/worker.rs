//! Worker-offloaded AEAD engine.
//!
//! Encryption and decryption run on a dedicated task reachable only through
//! message passing, keeping the caller's execution context free of crypto
//! work. Requests carry a correlation id; a router task resolves the pending
//! table as responses arrive, in whatever order the worker produces them.
//!
//! Key material is copied into each request payload - nothing is shared by
//! reference across the worker boundary.
//!
//! # Invariants
//!
//! - Every submitted request resolves exactly once: result, crypto error,
//!   timeout, or disposed - never left pending indefinitely
//! - A response for an id with no pending slot (duplicate, or a request
//!   that already timed out) is logged and dropped, never double-resolved
//! - A fresh random nonce is drawn inside the worker for every encryption;
//!   nonce reuse under a key is the one non-negotiable invariant here

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use shroud_crypto::{
    ConversationKey, Envelope, EnvelopeError, NONCE_SIZE, open_envelope, seal_envelope,
};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::env::Environment;

/// Default bound on how long a submitted request may stay unanswered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a submitted request may wait for its correlated response
    /// (also bounds the initialization handshake).
    pub request_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }
}

/// Errors surfaced by [`CryptoWorker`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker task could not be started or never completed its
    /// handshake. Fatal to initialization, not to the host process.
    #[error("crypto worker failed to start: {reason}")]
    SpawnFailed {
        /// Why startup failed.
        reason: String,
    },

    /// An operation was submitted before `initialize` succeeded.
    #[error("crypto worker is not initialized")]
    NotInitialized,

    /// No correlated response arrived within the configured bound.
    #[error("crypto request {request_id} timed out after {elapsed:?}")]
    Timeout {
        /// Correlation id of the abandoned request.
        request_id: u64,
        /// How long we waited.
        elapsed: Duration,
    },

    /// The worker was disposed while this request was pending.
    #[error("crypto worker disposed while request {request_id} was pending")]
    Disposed {
        /// Correlation id of the failed request.
        request_id: u64,
    },

    /// The cryptographic operation itself failed (authentication, version,
    /// metadata). Never retried.
    #[error(transparent)]
    Crypto(#[from] EnvelopeError),
}

impl WorkerError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Crypto failures are deterministic and spawn failures require
    /// re-initialization; only a timeout is worth retrying as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A unit of work shipped across the worker boundary.
#[derive(Debug)]
pub(crate) enum WorkerRequest {
    /// Seal plaintext under a conversation key.
    Encrypt { request_id: u64, plaintext: Vec<u8>, key: ConversationKey, key_id: String },
    /// Open an envelope under a conversation key.
    Decrypt { request_id: u64, envelope: Envelope, key: ConversationKey },
}

impl WorkerRequest {
    fn request_id(&self) -> u64 {
        match self {
            Self::Encrypt { request_id, .. } | Self::Decrypt { request_id, .. } => *request_id,
        }
    }
}

/// Result of one unit of worker work, correlated by id.
#[derive(Debug)]
pub(crate) struct WorkerResponse {
    pub(crate) request_id: u64,
    pub(crate) result: Result<WorkerOutput, EnvelopeError>,
}

/// Successful payload of a [`WorkerResponse`].
#[derive(Debug)]
pub(crate) enum WorkerOutput {
    Sealed(Envelope),
    Opened(Vec<u8>),
}

type PendingSlot = oneshot::Sender<Result<WorkerOutput, WorkerError>>;
type PendingTable = Arc<StdMutex<HashMap<u64, PendingSlot>>>;

enum WorkerState {
    Idle,
    Running(mpsc::UnboundedSender<WorkerRequest>),
    Disposed,
}

/// Handle to the crypto worker task.
///
/// Clones share the same worker, pending table, and lifecycle state; the
/// composition root constructs one and hands copies to the send and receive
/// paths.
pub struct CryptoWorker<E: Environment> {
    env: E,
    config: WorkerConfig,
    next_request_id: Arc<AtomicU64>,
    pending: PendingTable,
    state: Arc<Mutex<WorkerState>>,
}

impl<E: Environment> Clone for CryptoWorker<E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            config: self.config.clone(),
            next_request_id: Arc::clone(&self.next_request_id),
            pending: Arc::clone(&self.pending),
            state: Arc::clone(&self.state),
        }
    }
}

impl<E: Environment> CryptoWorker<E> {
    /// Create an uninitialized worker handle.
    pub fn new(env: E, config: WorkerConfig) -> Self {
        Self {
            env,
            config,
            next_request_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            state: Arc::new(Mutex::new(WorkerState::Idle)),
        }
    }

    /// Spawn the worker and response-router tasks and complete the Ready
    /// handshake.
    ///
    /// Idempotent: calling again while running is a no-op.
    ///
    /// # Errors
    ///
    /// - `SpawnFailed` if the worker exits before the handshake or the
    ///   handshake does not complete within the request timeout, or if the
    ///   worker was already disposed
    pub async fn initialize(&self) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        match &*state {
            WorkerState::Running(_) => return Ok(()),
            WorkerState::Disposed => {
                return Err(WorkerError::SpawnFailed {
                    reason: "worker has been disposed".to_string(),
                });
            },
            WorkerState::Idle => {},
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(worker_loop(self.env.clone(), request_rx, response_tx, ready_tx));
        tokio::spawn(route_responses(response_rx, Arc::clone(&self.pending)));

        tokio::select! {
            handshake = ready_rx => {
                if handshake.is_err() {
                    return Err(WorkerError::SpawnFailed {
                        reason: "worker exited before completing the handshake".to_string(),
                    });
                }
            },
            () = self.env.sleep(self.config.request_timeout) => {
                return Err(WorkerError::SpawnFailed {
                    reason: format!(
                        "no handshake within {:?}",
                        self.config.request_timeout
                    ),
                });
            },
        }

        *state = WorkerState::Running(request_tx);
        tracing::debug!("crypto worker initialized");
        Ok(())
    }

    /// Encrypt plaintext under a conversation key, off the caller's
    /// execution context.
    ///
    /// The worker draws a fresh random nonce for every call.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        key: &ConversationKey,
        key_id: &str,
    ) -> Result<Envelope, WorkerError> {
        let output = self
            .submit(|request_id| WorkerRequest::Encrypt {
                request_id,
                plaintext: plaintext.to_vec(),
                key: key.clone(),
                key_id: key_id.to_string(),
            })
            .await?;
        match output {
            WorkerOutput::Sealed(envelope) => Ok(envelope),
            WorkerOutput::Opened(_) => {
                unreachable!("correlated response cannot change operation kind")
            },
        }
    }

    /// Decrypt an envelope under a conversation key, off the caller's
    /// execution context.
    ///
    /// # Errors
    ///
    /// - `Crypto` for authentication, version, and metadata failures -
    ///   never altered or partial plaintext
    pub async fn decrypt(
        &self,
        envelope: &Envelope,
        key: &ConversationKey,
    ) -> Result<Vec<u8>, WorkerError> {
        let output = self
            .submit(|request_id| WorkerRequest::Decrypt {
                request_id,
                envelope: envelope.clone(),
                key: key.clone(),
            })
            .await?;
        match output {
            WorkerOutput::Opened(plaintext) => Ok(plaintext),
            WorkerOutput::Sealed(_) => {
                unreachable!("correlated response cannot change operation kind")
            },
        }
    }

    /// Terminate the worker and fail every still-pending request with a
    /// `Disposed` error.
    ///
    /// Further submissions (and re-initialization) are rejected.
    pub async fn dispose(&self) {
        {
            let mut state = self.state.lock().await;
            // Dropping the request sender ends the worker loop; the router
            // ends when the worker's response sender goes with it.
            *state = WorkerState::Disposed;
        }

        let drained: Vec<(u64, PendingSlot)> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(failed = drained.len(), "disposing crypto worker with pending requests");
        }
        for (request_id, slot) in drained {
            let _ = slot.send(Err(WorkerError::Disposed { request_id }));
        }
    }

    /// Register a pending slot, ship the request, and await the correlated
    /// response or the timeout, whichever resolves first.
    async fn submit(
        &self,
        build: impl FnOnce(u64) -> WorkerRequest,
    ) -> Result<WorkerOutput, WorkerError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let sender = {
            let state = self.state.lock().await;
            match &*state {
                WorkerState::Running(sender) => sender.clone(),
                WorkerState::Idle => return Err(WorkerError::NotInitialized),
                WorkerState::Disposed => return Err(WorkerError::Disposed { request_id }),
            }
        };

        let (slot_tx, slot_rx) = oneshot::channel();
        self.lock_pending().insert(request_id, slot_tx);

        if sender.send(build(request_id)).is_err() {
            self.lock_pending().remove(&request_id);
            return Err(WorkerError::Disposed { request_id });
        }

        tokio::select! {
            response = slot_rx => match response {
                Ok(result) => result,
                // Slot dropped without a send: treat as disposed.
                Err(_) => Err(WorkerError::Disposed { request_id }),
            },
            () = self.env.sleep(self.config.request_timeout) => {
                // Remove our slot so a late response is logged and dropped
                // instead of resolving a request nobody is awaiting.
                self.lock_pending().remove(&request_id);
                tracing::warn!(request_id, "crypto request timed out");
                Err(WorkerError::Timeout { request_id, elapsed: self.config.request_timeout })
            },
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingSlot>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wire a handle directly to externally controlled channels, skipping
    /// the spawn and handshake. Lets tests play the worker role: stall
    /// requests, send duplicates, or answer out of order.
    #[cfg(test)]
    pub(crate) fn attached_for_tests(
        env: E,
        config: WorkerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerRequest>, mpsc::UnboundedSender<WorkerResponse>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let worker = Self {
            env,
            config,
            next_request_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            state: Arc::new(Mutex::new(WorkerState::Running(request_tx))),
        };
        tokio::spawn(route_responses(response_rx, Arc::clone(&worker.pending)));
        (worker, request_rx, response_tx)
    }
}

/// The worker loop: the only place AEAD work actually executes.
///
/// Runs until the request channel closes (dispose dropped the sender) or
/// the router disappears.
async fn worker_loop<E: Environment>(
    env: E,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
    ready: oneshot::Sender<()>,
) {
    if ready.send(()).is_err() {
        // Initialization gave up before the handshake.
        return;
    }

    while let Some(request) = requests.recv().await {
        let request_id = request.request_id();
        let result = match request {
            WorkerRequest::Encrypt { plaintext, key, key_id, .. } => {
                let mut nonce = [0u8; NONCE_SIZE];
                env.random_bytes(&mut nonce);
                Ok(WorkerOutput::Sealed(seal_envelope(&plaintext, &key, &key_id, nonce)))
            },
            WorkerRequest::Decrypt { envelope, key, .. } => {
                open_envelope(&envelope, &key).map(WorkerOutput::Opened)
            },
        };

        if responses.send(WorkerResponse { request_id, result }).is_err() {
            // Router gone: the host side was disposed.
            return;
        }
    }
    tracing::debug!("crypto worker loop exited");
}

/// Resolve pending slots as responses arrive, in arrival order, correlated
/// purely by request id.
async fn route_responses(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: PendingTable,
) {
    while let Some(response) = responses.recv().await {
        let slot = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.request_id);
        match slot {
            Some(slot) => {
                // A submitter that raced the timeout is fine to ignore.
                let _ = slot.send(response.result.map_err(WorkerError::Crypto));
            },
            None => {
                tracing::warn!(
                    request_id = response.request_id,
                    "dropping response with no pending request (duplicate or timed out)"
                );
            },
        }
    }
}
