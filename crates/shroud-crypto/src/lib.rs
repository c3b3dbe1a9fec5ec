//! Shroud Cryptographic Primitives
//!
//! Envelope encryption building blocks for the Shroud client core. Pure
//! functions with deterministic outputs. Callers provide random bytes for
//! deterministic testing.
//!
//! # Key Lifecycle
//!
//! Conversation keys are fetched from an external key service and never used
//! directly for encryption. A per-envelope key is derived with HKDF-SHA256,
//! bound to the key identifier, so that the raw conversation key never
//! touches the AEAD and two conversations sharing key material by accident
//! still produce unrelated ciphertexts.
//!
//! ```text
//! Conversation Key (fetched)
//!        │
//!        ▼
//! HKDF → Envelope Key (per key_id)
//!        │
//!        ▼
//! AEAD Encryption → Envelope (metadata + ciphertext)
//! ```
//!
//! # Security
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD provides tamper-proof encryption
//! - Failed authentication tag -> reject envelope, never partial plaintext
//!
//! Nonce discipline:
//! - A fresh 24-byte random nonce is required per seal operation
//! - Nonce reuse under the same key is the one non-negotiable invariant of
//!   the whole subsystem; callers draw nonces from a CSPRNG
//!
//! Versioning:
//! - Envelope metadata carries an explicit wire version
//! - Decryption dispatches on that version and fails closed on anything it
//!   does not recognize; there is no format auto-detection

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod envelope;
mod keys;

pub use envelope::{
    ALGORITHM_CHACHA20_POLY1305, ALGORITHM_XCHACHA20_POLY1305, Envelope, EnvelopeError,
    EnvelopeMetadata, NONCE_SIZE, NONCE_SIZE_LEGACY, TAG_SIZE, WIRE_VERSION_CURRENT,
    WIRE_VERSION_LEGACY, open_envelope, seal_envelope, seal_envelope_legacy,
};
pub use keys::{ConversationKey, KEY_SIZE, derive_envelope_key};
