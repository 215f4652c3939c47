//! Fuzz target for STUN message decoding
//!
//! Tests that the decoder and the integrity checks handle arbitrary input
//! without panicking.

#![no_main]

use icelink_stun::StunMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Integrity checks work on raw bytes and must not assume a valid message
    let _ = StunMessage::verify_message_integrity(data, b"fuzzpasswordfuzzpassword");
    let _ = StunMessage::verify_fingerprint(data);

    if let Ok(message) = StunMessage::decode(data) {
        let _ = message.username();
        let _ = message.mapped_address();
        let _ = message.error_code();

        // Whatever decodes must encode again
        let encoded = message.encode().expect("decoded message re-encodes");
        assert_eq!(encoded.len() % 4, 0);
    }
});
