//! Fuzz target for the handshake codec and name validation.
//!
//! Run with: cargo +nightly fuzz run fuzz_handshake

#![no_main]

use libfuzzer_sys::fuzz_target;

use ferrule_core::proto;

fuzz_target!(|data: &[u8]| {
    if data.len() >= 3 {
        let hs = proto::Handshake::from_bytes([data[0], data[1], data[2]]);
        // Validation must never panic, whatever the bytes
        let _ = hs.validate();
        assert_eq!(hs.to_bytes(), [data[0], data[1], data[2]]);
    }
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = proto::is_valid_service_name(s);
    }
});
