//! Fuzz target for WireMessage::decode
//!
//! Feeds arbitrary bytes to the CBOR decoder: malformed CBOR, unknown fields,
//! non-shortest integer encodings, oversized byte strings and trailing data.
//!
//! # Invariants
//!
//! - Decoding never panics
//! - Anything that decodes re-encodes to exactly the input bytes

#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem_core::wire::WireMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = WireMessage::decode(data) {
        let encoded = message.encode().expect("decoded message must re-encode");
        assert_eq!(encoded, data, "accepted a non-canonical encoding");
    }
});
