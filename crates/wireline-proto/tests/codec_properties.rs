//! Property tests for the command codec.
//!
//! The codec contract is deterministic round-tripping: for every well-formed
//! command and every compression threshold, decode(encode(cmd)) is
//! structurally equal to cmd. The decoder additionally must reject arbitrary
//! input with an error rather than panicking.

use std::collections::HashMap;

use proptest::prelude::*;
use wireline_proto::command::{decode_command, encode_command};
use wireline_proto::{Command, Message};

fn arb_header() -> impl Strategy<Value = HashMap<String, String>> {
    proptest::collection::hash_map("[a-z-]{1,10}", "[ -~]{0,24}", 0..4)
}

fn arb_message() -> impl Strategy<Value = Message> {
    (proptest::collection::vec(any::<u8>(), 0..2048), arb_header())
        .prop_map(|(body, header)| Message { body, header })
}

fn arb_command() -> impl Strategy<Value = Command> {
    (
        any::<u8>(),
        proptest::collection::vec("[ -~]{0,16}", 0..4),
        arb_header(),
        proptest::option::of(arb_message()),
    )
        .prop_map(|(kind, params, header, message)| Command { kind, params, header, message })
}

proptest! {
    #[test]
    fn round_trip_preserves_structure(cmd in arb_command(), threshold in 0i32..4096) {
        let payload = encode_command(&cmd, threshold).unwrap();
        let decoded = decode_command(&payload).unwrap();
        prop_assert_eq!(decoded, cmd);
    }

    #[test]
    fn compressed_and_plain_encodings_agree(cmd in arb_command()) {
        // Force both paths for the same command and compare decodes.
        let plain = decode_command(&encode_command(&cmd, 0).unwrap()).unwrap();
        let packed = decode_command(&encode_command(&cmd, 1).unwrap()).unwrap();
        prop_assert_eq!(plain, packed);
    }

    #[test]
    fn decoder_never_panics_on_arbitrary_input(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        // Errors are fine; panics are not.
        let _ = decode_command(&bytes);
    }
}
