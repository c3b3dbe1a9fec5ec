//! Message pipeline: the composition root for the client core.
//!
//! Owns one [`KeyCache`], one [`CryptoWorker`], and one [`StatusReconciler`]
//! and wires them into the send and receive paths. There is no global
//! state: the application constructs one pipeline at startup and hands
//! clones (cheap handles over the same instances) to its consumers.

use std::sync::Arc;

use async_trait::async_trait;
use shroud_crypto::{ConversationKey, Envelope};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    env::Environment,
    key_cache::{CacheConfig, KeyCache, KeyCacheError, KeyFetchError},
    reconcile::{
        MessageStatus, ReconcileError, RetryPolicy, StatusEvent, StatusReconciler, StatusStore,
    },
    worker::{CryptoWorker, WorkerConfig, WorkerError},
};

/// The external key-retrieval collaborator.
///
/// Implementations talk to the key service; they may fail or be slow. The
/// pipeline only ever calls this through the cache, so concurrent requests
/// for one conversation collapse into a single fetch.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    /// Fetch the symmetric key for a conversation.
    async fn fetch_key(&self, conversation_id: &str) -> Result<ConversationKey, KeyFetchError>;
}

/// Tuning knobs for the whole pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Key cache TTL and capacity.
    pub cache: CacheConfig,
    /// Crypto worker timeout.
    pub worker: WorkerConfig,
    /// Status persistence retry policy.
    pub retry: RetryPolicy,
}

/// Errors surfaced by pipeline operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Key retrieval failed (propagated from the cache).
    #[error(transparent)]
    Key(#[from] KeyCacheError),

    /// Encryption or decryption failed (propagated from the worker).
    #[error(transparent)]
    Crypto(#[from] WorkerError),

    /// A status transition was illegal.
    #[error(transparent)]
    Status(#[from] ReconcileError),
}

/// Send/receive orchestration over the three subsystems.
pub struct MessagePipeline<E: Environment, S: StatusStore, K: KeySource> {
    keys: Arc<K>,
    key_cache: KeyCache<E>,
    worker: CryptoWorker<E>,
    reconciler: StatusReconciler<E, S>,
}

impl<E: Environment, S: StatusStore, K: KeySource> Clone for MessagePipeline<E, S, K> {
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
            key_cache: self.key_cache.clone(),
            worker: self.worker.clone(),
            reconciler: self.reconciler.clone(),
        }
    }
}

impl<E: Environment, S: StatusStore, K: KeySource> MessagePipeline<E, S, K> {
    /// Assemble a pipeline from its collaborators.
    ///
    /// Call [`MessagePipeline::initialize`] before sending or receiving.
    pub fn new(env: E, status_store: S, key_source: K, config: PipelineConfig) -> Self {
        Self {
            keys: Arc::new(key_source),
            key_cache: KeyCache::new(env.clone(), config.cache),
            worker: CryptoWorker::new(env.clone(), config.worker),
            reconciler: StatusReconciler::new(env, status_store, config.retry),
        }
    }

    /// Start the crypto worker. Idempotent.
    ///
    /// # Errors
    ///
    /// - `SpawnFailed` if the worker cannot be started; fatal to this
    ///   subsystem but not to the host process
    pub async fn initialize(&self) -> Result<(), WorkerError> {
        self.worker.initialize().await
    }

    /// Encrypt and stage an outbound message.
    ///
    /// The message is optimistically marked `sending` before any key or
    /// crypto work happens, and `sent` once the envelope exists. Failure to
    /// produce an envelope marks it `failed`; the returned error says why.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        plaintext: &[u8],
    ) -> Result<Envelope, PipelineError> {
        self.reconciler.update_status(message_id, MessageStatus::Sending, true)?;

        match self.encrypt_for(conversation_id, plaintext).await {
            Ok(envelope) => {
                self.reconciler.update_status(message_id, MessageStatus::Sent, true)?;
                Ok(envelope)
            },
            Err(error) => {
                tracing::warn!(
                    conversation_id,
                    message_id,
                    %error,
                    "send failed before transport"
                );
                // The sending -> failed transition is always legal; nothing
                // useful to do if the record vanished meanwhile.
                let _ = self.reconciler.update_status(message_id, MessageStatus::Failed, true);
                Err(error)
            },
        }
    }

    /// Decrypt an inbound envelope and hand back the plaintext.
    ///
    /// Decryption failure is surfaced as a typed error so the UI can render
    /// a placeholder - fabricated plaintext is never returned. Delivery
    /// receipts for the sender are driven separately via
    /// [`MessagePipeline::mark_delivered`].
    pub async fn receive_message(
        &self,
        conversation_id: &str,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, PipelineError> {
        let key = self.conversation_key(conversation_id).await?;
        Ok(self.worker.decrypt(envelope, &key).await?)
    }

    /// Record a delivery receipt for one of our sent messages.
    pub fn mark_delivered(&self, message_id: &str) -> Result<(), PipelineError> {
        Ok(self.reconciler.update_status(message_id, MessageStatus::Delivered, true)?)
    }

    /// Record a read receipt.
    ///
    /// Read receipts are externally driven and must never show unconfirmed,
    /// so this takes the direct (write-then-emit) path.
    pub fn mark_read(&self, message_id: &str) -> Result<(), PipelineError> {
        Ok(self.reconciler.update_status(message_id, MessageStatus::Read, false)?)
    }

    /// Subscribe to status-change events.
    pub fn events(&self) -> broadcast::Receiver<StatusEvent> {
        self.reconciler.status_updates()
    }

    /// Warm the key cache for conversations about to be displayed.
    pub async fn warm_conversations(&self, conversation_ids: &[String]) {
        let keys = Arc::clone(&self.keys);
        self.key_cache
            .preload(conversation_ids, move |conversation_id| {
                let keys = Arc::clone(&keys);
                async move { keys.fetch_key(&conversation_id).await }
            })
            .await;
    }

    /// The key cache, for invalidation and sweeper wiring.
    pub fn key_cache(&self) -> &KeyCache<E> {
        &self.key_cache
    }

    /// The status reconciler, for batch updates.
    pub fn reconciler(&self) -> &StatusReconciler<E, S> {
        &self.reconciler
    }

    /// Tear down the crypto worker, failing any in-flight crypto requests.
    pub async fn shutdown(&self) {
        self.worker.dispose().await;
    }

    async fn encrypt_for(
        &self,
        conversation_id: &str,
        plaintext: &[u8],
    ) -> Result<Envelope, PipelineError> {
        let key = self.conversation_key(conversation_id).await?;
        Ok(self.worker.encrypt(plaintext, &key, conversation_id).await?)
    }

    async fn conversation_key(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationKey, PipelineError> {
        let keys = Arc::clone(&self.keys);
        let id = conversation_id.to_string();
        let key = self
            .key_cache
            .get(conversation_id, move || async move { keys.fetch_key(&id).await })
            .await?;
        Ok(key)
    }
}
