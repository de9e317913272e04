//! # Wire Codec
//!
//! Text framing for the three messages that cross a gate.
//!
//! ```text
//! request endpoint   shim -> coordinator   "start\n" | "start <id>\n"
//! return endpoint    shim -> coordinator   "<id>\n"  | "\n"          (hello)
//! return endpoint    coordinator -> shim   "<message>\n<exit_code>\n"
//! ```
//!
//! The result frame is terminated by the coordinator closing the connection,
//! so the message may span several lines: the exit code is always the last
//! line.

use crate::types::{CorrelationId, GateError, StageResult, StartToken};

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum length of a request or hello line, newline included.
pub const MAX_LINE_LEN: usize = 128;

/// Maximum size of an encoded result frame.
pub const MAX_RESULT_LEN: usize = 1024 * 1024;

// =============================================================================
// START TOKEN
// =============================================================================

/// Encode a start token as a single newline-terminated line.
#[must_use]
pub fn encode_token(token: &StartToken) -> String {
    match &token.correlation {
        Some(id) => format!("{} {}\n", StartToken::LITERAL, id),
        None => format!("{}\n", StartToken::LITERAL),
    }
}

/// Decode a request line (with or without its trailing newline).
pub fn decode_token(line: &str) -> Result<StartToken, GateError> {
    let line = strip_newline(line);
    let mut parts = line.splitn(2, ' ');

    match (parts.next(), parts.next()) {
        (Some(StartToken::LITERAL), None) => Ok(StartToken::anonymous()),
        (Some(StartToken::LITERAL), Some(id)) => {
            Ok(StartToken::with_correlation(CorrelationId::new(id)?))
        }
        _ => Err(GateError::MalformedMessage(format!(
            "expected '{}' token, got {:?}",
            StartToken::LITERAL,
            truncate_for_log(line)
        ))),
    }
}

// =============================================================================
// RETURN HELLO
// =============================================================================

/// Encode the line a shim writes after connecting to the return endpoint.
#[must_use]
pub fn encode_hello(correlation: Option<&CorrelationId>) -> String {
    match correlation {
        Some(id) => format!("{}\n", id),
        None => "\n".to_string(),
    }
}

/// Decode a return hello line. An empty line is an anonymous waiter.
pub fn decode_hello(line: &str) -> Result<Option<CorrelationId>, GateError> {
    let line = strip_newline(line);
    if line.is_empty() {
        Ok(None)
    } else {
        CorrelationId::new(line).map(Some)
    }
}

// =============================================================================
// STAGE RESULT
// =============================================================================

/// Encode a stage result frame.
#[must_use]
pub fn encode_result(result: &StageResult) -> String {
    format!("{}\n{}\n", result.message, result.exit_code)
}

/// Decode a complete result frame.
pub fn decode_result(frame: &[u8]) -> Result<StageResult, GateError> {
    if frame.len() > MAX_RESULT_LEN {
        return Err(GateError::MalformedMessage(format!(
            "result frame of {} bytes exceeds {} bytes",
            frame.len(),
            MAX_RESULT_LEN
        )));
    }

    let text = std::str::from_utf8(frame)
        .map_err(|e| GateError::MalformedMessage(format!("result is not UTF-8: {}", e)))?;

    let body = text.strip_suffix('\n').ok_or_else(|| {
        GateError::MalformedMessage("result frame is not newline terminated".to_string())
    })?;

    let (message, code) = body.rsplit_once('\n').ok_or_else(|| {
        GateError::MalformedMessage("result frame has no exit code line".to_string())
    })?;

    let exit_code = code.parse::<i32>().map_err(|_| {
        GateError::MalformedMessage(format!("invalid exit code {:?}", truncate_for_log(code)))
    })?;

    Ok(StageResult::new(message, exit_code))
}

// =============================================================================
// HELPERS
// =============================================================================

fn strip_newline(line: &str) -> &str {
    line.strip_suffix('\n').unwrap_or(line)
}

/// Keep error messages about hostile input short.
fn truncate_for_log(s: &str) -> &str {
    match s.char_indices().nth(32) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EXIT_FAILURE;

    #[test]
    fn anonymous_token_is_bare_literal() {
        assert_eq!(encode_token(&StartToken::anonymous()), "start\n");
        assert_eq!(decode_token("start\n").expect("decode"), StartToken::anonymous());
        assert_eq!(decode_token("start").expect("decode"), StartToken::anonymous());
    }

    #[test]
    fn token_with_correlation() {
        let id = CorrelationId::new("4711-1").expect("id");
        let token = StartToken::with_correlation(id.clone());
        assert_eq!(encode_token(&token), "start 4711-1\n");
        assert_eq!(
            decode_token("start 4711-1\n").expect("decode").correlation,
            Some(id)
        );
    }

    #[test]
    fn unknown_token_rejected() {
        assert!(matches!(
            decode_token("stop\n"),
            Err(GateError::MalformedMessage(_))
        ));
        assert!(matches!(decode_token(""), Err(GateError::MalformedMessage(_))));
        assert!(matches!(
            decode_token("start a b\n"),
            Err(GateError::MalformedMessage(_))
        ));
    }

    #[test]
    fn hello_lines() {
        assert_eq!(decode_hello("\n").expect("decode"), None);
        let id = CorrelationId::new("x").expect("id");
        assert_eq!(
            decode_hello(&encode_hello(Some(&id))).expect("decode"),
            Some(id)
        );
    }

    #[test]
    fn result_frame_layout() {
        let result = StageResult::new("dhcp lease failed", EXIT_FAILURE);
        assert_eq!(encode_result(&result), "dhcp lease failed\n1\n");
    }

    #[test]
    fn multiline_message_survives() {
        let result = StageResult::new("line one\nline two\n", 3);
        let decoded = decode_result(encode_result(&result).as_bytes()).expect("decode");
        assert_eq!(decoded, result);
    }

    #[test]
    fn empty_message_survives() {
        let decoded = decode_result(b"\n0\n").expect("decode");
        assert_eq!(decoded.message, "");
        assert_eq!(decoded.exit_code, 0);
    }

    #[test]
    fn truncated_frames_rejected() {
        assert!(decode_result(b"").is_err());
        assert!(decode_result(b"done\n").is_err());
        assert!(decode_result(b"done\n0").is_err());
        assert!(decode_result(b"done\nzero\n").is_err());
        assert!(decode_result(&[0xff, b'\n', b'0', b'\n']).is_err());
    }
}
