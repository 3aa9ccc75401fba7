//! Fuzz target for inbound wire decoding
//!
//! Feeds arbitrary bytes to both decoders a receiver runs on untrusted input:
//! the outer `WireMessage` frame and the pairwise plaintext envelope.
//!
//! # Invariants
//!
//! - Decoding never panics; malformed input is an error
//! - Anything that decodes re-encodes to a frame that decodes to the same value

#![no_main]

use libfuzzer_sys::fuzz_target;
use murmur_core::{PairwisePayload, WireMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = WireMessage::decode(data) {
        let encoded = message.encode().expect("decoded message must re-encode");
        assert_eq!(WireMessage::decode(&encoded).expect("re-encoded frame must decode"), message);
    }

    if let Ok(payload) = PairwisePayload::decode(data) {
        let encoded = payload.encode().expect("decoded payload must re-encode");
        let decoded = PairwisePayload::decode(&encoded).expect("re-encoded payload must decode");
        assert_eq!(decoded, payload);

    }
});
