//! Fuzz target for EnvelopeMetadata::from_json
//!
//! This fuzzer tests metadata deserialization with:
//! - Malformed JSON
//! - Missing or duplicated fields
//! - Non-base64 content in binary fields
//! - Oversized strings and absurd version numbers
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shroud_crypto::EnvelopeMetadata;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    // Attempt to parse the metadata
    // This should never panic, only return Err for invalid input
    if let Ok(metadata) = EnvelopeMetadata::from_json(&text) {
        // Whatever parsed must re-serialize and re-parse to the same value
        let json = metadata.to_json().unwrap();
        let reparsed = EnvelopeMetadata::from_json(&json).unwrap();
        assert_eq!(reparsed, metadata);
    }
});
