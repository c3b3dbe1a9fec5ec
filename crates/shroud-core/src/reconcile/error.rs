//! Error types for status reconciliation.
//!
//! Remote-store failures never reach the caller as errors - they surface as
//! stream events so the UI can render pending/failed affordances. The only
//! caller-visible error is requesting an illegal transition.

use std::time::Duration;

use thiserror::Error;

use super::status::MessageStatus;

/// Errors from the remote status-write collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusStoreError {
    /// The store could not be reached or answered with a server error.
    #[error("status store unavailable: {reason}")]
    Unavailable {
        /// Why the store was unavailable.
        reason: String,
    },

    /// The store did not answer in time.
    #[error("status write timed out after {elapsed:?}")]
    Timeout {
        /// How long we waited.
        elapsed: Duration,
    },

    /// The store answered and refused the write. Retrying the same write
    /// will not change its mind.
    #[error("status write rejected: {reason}")]
    Rejected {
        /// Why the write was refused.
        reason: String,
    },
}

impl StatusStoreError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Rejections are deterministic and are never retried; only network
    /// weather is worth the backoff schedule.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Errors returned synchronously by reconciler operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The requested transition is illegal from the message's current
    /// optimistic status.
    #[error("invalid status transition for {message_id}: {from} -> {to}")]
    InvalidTransition {
        /// Message whose transition was rejected.
        message_id: String,
        /// Current optimistic status.
        from: MessageStatus,
        /// Requested status.
        to: MessageStatus,
    },
}
