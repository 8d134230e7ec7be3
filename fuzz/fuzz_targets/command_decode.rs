//! Fuzz target for the command decoder.
//!
//! Arbitrary bytes through `decode_command`: malformed markers, corrupt
//! snappy blocks, hostile CBOR documents. The decoder must only ever return
//! an error, never panic. Inputs that decode are re-encoded both ways to
//! exercise the encoder on decoder-accepted structures.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wireline_proto::command::{decode_command, encode_command};

fuzz_target!(|data: &[u8]| {
    if let Ok(cmd) = decode_command(data) {
        // Whatever decoded must re-encode and round-trip on both paths.
        for threshold in [0, 1] {
            if let Ok(payload) = encode_command(&cmd, threshold) {
                let again = decode_command(&payload).expect("re-encoded command must decode");
                assert_eq!(again, cmd);
            }
        }
    }
});
