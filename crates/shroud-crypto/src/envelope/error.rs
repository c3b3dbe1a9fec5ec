//! Error types for envelope sealing and opening.
//!
//! Decryption failures are typed so callers can distinguish authentication
//! failures (wrong key, tampering; never retried) from protocol failures
//! (unknown version, malformed metadata; fatal to the single operation).

use thiserror::Error;

/// Errors from envelope encryption, decryption, and metadata handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Authentication tag did not verify (tampering or wrong key).
    #[error("envelope authentication failed")]
    AuthenticationFailed,

    /// Metadata carried a wire version this build does not support.
    #[error("unsupported envelope version {version}")]
    UnsupportedVersion {
        /// The version found in the metadata.
        version: u8,
    },

    /// Metadata was malformed or internally inconsistent.
    #[error("invalid envelope metadata ({field}): {reason}")]
    InvalidMetadata {
        /// Which metadata field was rejected.
        field: &'static str,
        /// Why the field was rejected.
        reason: String,
    },

    /// Key material had the wrong length.
    #[error("invalid key length: expected 32 bytes, got {actual}")]
    InvalidKeyLength {
        /// Length of the rejected key material.
        actual: usize,
    },
}

impl EnvelopeError {
    /// Returns true if this error means the ciphertext failed to
    /// authenticate.
    ///
    /// Authentication failures are never retried: the same inputs will fail
    /// the same way, and falling back to an unauthenticated path is not an
    /// option.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failure_is_classified() {
        assert!(EnvelopeError::AuthenticationFailed.is_authentication_failure());
        assert!(!EnvelopeError::UnsupportedVersion { version: 9 }.is_authentication_failure());
    }

    #[test]
    fn errors_render_their_context() {
        let error = EnvelopeError::InvalidMetadata {
            field: "iv",
            reason: "expected 24 bytes, got 3".to_string(),
        };
        assert_eq!(error.to_string(), "invalid envelope metadata (iv): expected 24 bytes, got 3");
    }
}
