//! Envelope sealing and opening using `XChaCha20-Poly1305`
//!
//! All functions are pure - random nonce bytes must be provided by the
//! caller. This enables deterministic testing and keeps the crypto worker
//! free to source randomness from its environment.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};

use super::{
    ALGORITHM_CHACHA20_POLY1305, ALGORITHM_XCHACHA20_POLY1305, Envelope, EnvelopeMetadata,
    NONCE_SIZE, NONCE_SIZE_LEGACY, TAG_SIZE, WIRE_VERSION_CURRENT, WIRE_VERSION_LEGACY,
    error::EnvelopeError,
};
use crate::keys::{ConversationKey, derive_envelope_key};

/// Seal plaintext into a current-version envelope.
///
/// The authentication tag is split out of the AEAD output and stored in the
/// metadata, matching the wire format.
///
/// # Security
///
/// - `nonce` MUST be fresh, cryptographically secure randomness; reusing a
///   nonce under the same key breaks the cipher
/// - The AEAD key is derived from `key` and `key_id`, so the raw
///   conversation key never touches the cipher
pub fn seal_envelope(
    plaintext: &[u8],
    key: &ConversationKey,
    key_id: &str,
    nonce: [u8; NONCE_SIZE],
) -> Envelope {
    let envelope_key = derive_envelope_key(key, key_id);
    let cipher = XChaCha20Poly1305::new(&envelope_key.into());

    let Ok(mut sealed) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    // AEAD output is ciphertext || tag; the tag travels in the metadata.
    let auth_tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Envelope {
        metadata: EnvelopeMetadata {
            key_id: key_id.to_string(),
            algorithm: ALGORITHM_XCHACHA20_POLY1305.to_string(),
            iv: nonce.to_vec(),
            auth_tag,
            version: WIRE_VERSION_CURRENT,
        },
        ciphertext: sealed,
    }
}

/// Seal plaintext into a legacy (v1) envelope.
///
/// Kept for producing fixtures that exercise the legacy decrypt path and
/// for interop tests against clients that have not upgraded. New traffic
/// uses [`seal_envelope`].
pub fn seal_envelope_legacy(
    plaintext: &[u8],
    key: &ConversationKey,
    key_id: &str,
    nonce: [u8; NONCE_SIZE_LEGACY],
) -> Envelope {
    let envelope_key = derive_envelope_key(key, key_id);
    let cipher = ChaCha20Poly1305::new(&envelope_key.into());

    let Ok(mut sealed) = cipher.encrypt(Nonce::from_slice(&nonce), plaintext) else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let auth_tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Envelope {
        metadata: EnvelopeMetadata {
            key_id: key_id.to_string(),
            algorithm: ALGORITHM_CHACHA20_POLY1305.to_string(),
            iv: nonce.to_vec(),
            auth_tag,
            version: WIRE_VERSION_LEGACY,
        },
        ciphertext: sealed,
    }
}

/// Open an envelope, dispatching on its wire version.
///
/// # Errors
///
/// - `UnsupportedVersion`: metadata names a version this build does not know
/// - `InvalidMetadata`: algorithm/nonce/tag inconsistent with the version
/// - `AuthenticationFailed`: tag did not verify (tampering or wrong key);
///   no partial or altered plaintext is ever returned
pub fn open_envelope(envelope: &Envelope, key: &ConversationKey) -> Result<Vec<u8>, EnvelopeError> {
    let metadata = &envelope.metadata;

    if metadata.auth_tag.len() != TAG_SIZE {
        return Err(EnvelopeError::InvalidMetadata {
            field: "auth_tag",
            reason: format!("expected {TAG_SIZE} bytes, got {}", metadata.auth_tag.len()),
        });
    }

    // AEAD APIs want ciphertext || tag back in one buffer.
    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&metadata.auth_tag);

    let envelope_key = derive_envelope_key(key, &metadata.key_id);

    match metadata.version {
        WIRE_VERSION_CURRENT => {
            check_algorithm(metadata, ALGORITHM_XCHACHA20_POLY1305)?;
            check_nonce_len(metadata, NONCE_SIZE)?;
            let cipher = XChaCha20Poly1305::new(&envelope_key.into());
            cipher
                .decrypt(XNonce::from_slice(&metadata.iv), sealed.as_slice())
                .map_err(|_| EnvelopeError::AuthenticationFailed)
        },
        WIRE_VERSION_LEGACY => {
            check_algorithm(metadata, ALGORITHM_CHACHA20_POLY1305)?;
            check_nonce_len(metadata, NONCE_SIZE_LEGACY)?;
            let cipher = ChaCha20Poly1305::new(&envelope_key.into());
            cipher
                .decrypt(Nonce::from_slice(&metadata.iv), sealed.as_slice())
                .map_err(|_| EnvelopeError::AuthenticationFailed)
        },
        version => Err(EnvelopeError::UnsupportedVersion { version }),
    }
}

fn check_algorithm(metadata: &EnvelopeMetadata, expected: &'static str) -> Result<(), EnvelopeError> {
    if metadata.algorithm == expected {
        Ok(())
    } else {
        Err(EnvelopeError::InvalidMetadata {
            field: "algorithm",
            reason: format!("version {} requires {expected}, got {}", metadata.version, metadata.algorithm),
        })
    }
}

fn check_nonce_len(metadata: &EnvelopeMetadata, expected: usize) -> Result<(), EnvelopeError> {
    if metadata.iv.len() == expected {
        Ok(())
    } else {
        Err(EnvelopeError::InvalidMetadata {
            field: "iv",
            reason: format!("expected {expected} bytes, got {}", metadata.iv.len()),
        })
    }
}
