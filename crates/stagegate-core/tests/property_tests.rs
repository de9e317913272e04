//! # Property-Based Tests
//!
//! Codec invariants the shim relies on when forwarding a result verbatim.

use proptest::prelude::*;
use stagegate_core::{
    StageResult, decode_hello, decode_result, decode_token, encode_result,
};

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Any message, including embedded newlines, reaches the shim unmodified
    /// together with its exit code.
    #[test]
    fn message_and_code_pass_through(message in "(?s).{0,256}", code in any::<i32>()) {
        let result = StageResult::new(message.clone(), code);
        let decoded = decode_result(encode_result(&result).as_bytes()).expect("decode");
        prop_assert_eq!(decoded.message, message);
        prop_assert_eq!(decoded.exit_code, code);
    }

    /// Arbitrary bytes on any channel yield an error or a value, never a panic.
    #[test]
    fn decoders_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_result(&bytes);
        let text = String::from_utf8_lossy(&bytes);
        let _ = decode_token(&text);
        let _ = decode_hello(&text);
    }

    /// Process exit status is zero only for a zero exit code.
    #[test]
    fn exit_status_zero_only_for_success(code in any::<i32>()) {
        let status = StageResult::new("x", code).process_exit_code();
        prop_assert_eq!(status == 0, code == 0);
    }
}
