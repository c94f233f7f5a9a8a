//! Fuzz target for the message frame decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_message_codec
//!
//! Feeds arbitrary bytes to `Message::read_from` — frame counts and
//! sizes must be rejected before allocation, never panic or OOM.

#![no_main]

use libfuzzer_sys::fuzz_target;

use ferrule_core::Message;

fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    rt.block_on(async {
        let mut reader = data;
        let _ = Message::read_from(&mut reader).await;
    });
});
