//! Fuzz target for the frame reader.
//!
//! Arbitrary bytes as a wire stream: truncated frames, corrupt MACs, bogus
//! length prefixes. The reader must end in a clean EOF or an error, never a
//! panic, and never hand out a frame whose MAC did not verify.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wireline_proto::{FrameReader, SessionKeys};

fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime construction cannot fail");

    rt.block_on(async {
        let keys = SessionKeys::derive(b"frame fuzz", None);
        let mut reader = FrameReader::new(data, &keys.read_cipher, &keys.read_mac);
        // Reading until EOF or the first error covers multi-frame streams.
        while let Ok(Some(_)) = reader.read_frame().await {}
    });
});
