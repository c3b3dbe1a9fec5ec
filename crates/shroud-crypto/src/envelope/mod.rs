//! Versioned AEAD envelope format.
//!
//! An [`Envelope`] is the unit handed to transport and storage: opaque
//! ciphertext plus the [`EnvelopeMetadata`] needed to decrypt it later. The
//! metadata is serialized as JSON with base64 binary fields
//! (`{key_id, algorithm, iv, auth_tag, version}`); the `version` field
//! selects the decrypt code path and unknown versions fail closed.

mod error;
mod seal;

use base64::engine::general_purpose::STANDARD as BASE64;
pub use error::EnvelopeError;
pub use seal::{open_envelope, seal_envelope, seal_envelope_legacy};
use serde::{Deserialize, Serialize};

/// Current wire version: XChaCha20-Poly1305 with a 24-byte nonce.
pub const WIRE_VERSION_CURRENT: u8 = 2;

/// Legacy wire version: ChaCha20-Poly1305 with a 12-byte nonce.
///
/// Still produced by older clients; decryption support is kept for the two
/// most recent formats.
pub const WIRE_VERSION_LEGACY: u8 = 1;

/// Nonce size for the current wire version (XChaCha20).
pub const NONCE_SIZE: usize = 24;

/// Nonce size for the legacy wire version (ChaCha20).
pub const NONCE_SIZE_LEGACY: usize = 12;

/// Poly1305 authentication tag size (both versions).
pub const TAG_SIZE: usize = 16;

/// Algorithm identifier for the current wire version.
pub const ALGORITHM_XCHACHA20_POLY1305: &str = "xchacha20-poly1305";

/// Algorithm identifier for the legacy wire version.
pub const ALGORITHM_CHACHA20_POLY1305: &str = "chacha20-poly1305";

/// Decryption parameters stored alongside the ciphertext.
///
/// The `algorithm` string is redundant with `version` and is validated
/// against it on decrypt; a disagreement is a protocol error, not a guess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    /// Identifier of the key that sealed this envelope.
    pub key_id: String,
    /// AEAD algorithm identifier.
    pub algorithm: String,
    /// Nonce, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    /// Poly1305 tag, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    /// Wire version selecting the decrypt path.
    pub version: u8,
}

impl EnvelopeMetadata {
    /// Serialize to the JSON wire/storage representation.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self)
            .map_err(|e| EnvelopeError::InvalidMetadata { field: "metadata", reason: e.to_string() })
    }

    /// Parse the JSON wire/storage representation.
    ///
    /// # Errors
    ///
    /// - `EnvelopeError::InvalidMetadata` for malformed JSON, missing fields,
    ///   or fields that fail base64 decoding
    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(json)
            .map_err(|e| EnvelopeError::InvalidMetadata { field: "metadata", reason: e.to_string() })
    }
}

/// An encrypted message with the metadata required to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Decryption parameters.
    pub metadata: EnvelopeMetadata,
    /// Ciphertext without the authentication tag (the tag lives in
    /// `metadata.auth_tag`).
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Plaintext length this envelope decrypts to.
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len()
    }
}

/// Serde adapter encoding byte fields as base64 strings.
mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::BASE64;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}
