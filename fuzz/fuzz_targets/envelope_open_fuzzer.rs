//! Fuzz target for open_envelope
//!
//! This fuzzer tests envelope decryption with arbitrary metadata and
//! ciphertext:
//! - Arbitrary versions (only 1 and 2 may proceed past dispatch)
//! - Nonce and tag fields of any length
//! - Ciphertext bytes unrelated to any real encryption
//!
//! The fuzzer should NEVER panic and NEVER return fabricated plaintext:
//! for garbage input the only success path would be a forged Poly1305 tag.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shroud_crypto::{ConversationKey, Envelope, EnvelopeMetadata, open_envelope};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    key: [u8; 32],
    key_id: String,
    algorithm: String,
    iv: Vec<u8>,
    auth_tag: Vec<u8>,
    version: u8,
    ciphertext: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let envelope = Envelope {
        metadata: EnvelopeMetadata {
            key_id: input.key_id,
            algorithm: input.algorithm,
            iv: input.iv,
            auth_tag: input.auth_tag,
            version: input.version,
        },
        ciphertext: input.ciphertext,
    };
    let key = ConversationKey::from_bytes(input.key);

    // Authentication of random bytes must fail; any Ok here means a forged
    // tag, which is worth crashing the fuzzer over.
    assert!(open_envelope(&envelope, &key).is_err());
});
