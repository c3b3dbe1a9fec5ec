//! Conversation key material and envelope key derivation using HKDF

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::envelope::EnvelopeError;

/// Size of a conversation key in bytes.
pub const KEY_SIZE: usize = 32;

/// Label used for envelope key derivation
const ENVELOPE_KEY_LABEL: &[u8] = b"shroudEnvelopeV1";

/// A symmetric conversation key fetched from the key service.
///
/// Key material is zeroized when the value is dropped. The key is cloned
/// into crypto requests (copy-out semantics); it is never shared by
/// reference across the worker boundary.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey([u8; KEY_SIZE]);

impl ConversationKey {
    /// Wrap raw 32-byte key material.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Wrap key material of unchecked length.
    ///
    /// # Errors
    ///
    /// - `EnvelopeError::InvalidKeyLength` if the slice is not 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let material: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| EnvelopeError::InvalidKeyLength { actual: bytes.len() })?;
        Ok(Self(material))
    }

    /// Raw key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Never print key material, even at trace level.
impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

/// Derive the per-envelope AEAD key from a conversation key.
///
/// This produces a 32-byte key that is unique per (conversation key,
/// `key_id`) pair, so the fetched key material never touches the cipher
/// directly.
///
/// # Security
///
/// - Different key ids produce different envelope keys (domain separation)
/// - Deterministic: same inputs always produce same output
pub fn derive_envelope_key(key: &ConversationKey, key_id: &str) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, key.as_bytes());

    // Build the info parameter: label || key_id
    let mut info = Vec::with_capacity(ENVELOPE_KEY_LABEL.len() + key_id.len());
    info.extend_from_slice(ENVELOPE_KEY_LABEL);
    info.extend_from_slice(key_id.as_bytes());

    let mut derived = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(&info, &mut derived) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    derived
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> ConversationKey {
        let mut material = [0u8; KEY_SIZE];
        for (i, byte) in material.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ConversationKey::from_bytes(material)
    }

    #[test]
    fn from_slice_accepts_32_bytes() {
        let key = ConversationKey::from_slice(&[0xAB; KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes(), &[0xAB; KEY_SIZE]);
    }

    #[test]
    fn from_slice_rejects_other_lengths() {
        let result = ConversationKey::from_slice(&[0xAB; 16]);
        assert!(matches!(result, Err(EnvelopeError::InvalidKeyLength { actual: 16 })));
    }

    #[test]
    fn derivation_is_deterministic() {
        let key = test_key();

        let derived1 = derive_envelope_key(&key, "conv-1");
        let derived2 = derive_envelope_key(&key, "conv-1");

        assert_eq!(derived1, derived2, "same inputs must produce same output");
    }

    #[test]
    fn different_key_ids_produce_different_envelope_keys() {
        let key = test_key();

        let derived_a = derive_envelope_key(&key, "conv-a");
        let derived_b = derive_envelope_key(&key, "conv-b");

        assert_ne!(derived_a, derived_b, "different key ids must produce different keys");
    }

    #[test]
    fn derived_key_differs_from_raw_material() {
        let key = test_key();
        let derived = derive_envelope_key(&key, "conv-1");
        assert_ne!(&derived, key.as_bytes());
    }

    #[test]
    fn debug_redacts_key_material() {
        let rendered = format!("{:?}", test_key());
        assert_eq!(rendered, "ConversationKey(..)");
    }

    #[test]
    fn empty_key_id_still_derives() {
        let derived = derive_envelope_key(&test_key(), "");
        assert_eq!(derived.len(), KEY_SIZE);
    }
}
