//! Stream Codec Module
//!
//! Framing for the TradingView streaming socket.
//!
//! Every WebSocket text message carries one or more frames:
//!
//! ```text
//! ~m~52~m~{"m":"quote_create_session","p":["qs_abcdefghijkl"]}
//! ~m~4~m~~h~7
//! ```
//!
//! The declared length counts UTF-16 code units of the payload. A payload
//! starting with `~h~` is a keepalive and must be echoed back unchanged;
//! anything else is a JSON object.

use serde_json::{Value, json};

const FRAME_MARKER: &str = "~m~";
const KEEPALIVE_PREFIX: &str = "~h~";

/// Codec errors. All of them describe a single malformed frame; the
/// surrounding frames still decode.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame marker present but the length header is unreadable.
    #[error("malformed frame header")]
    MalformedHeader,

    /// Text outside any frame.
    #[error("unframed data: {0}")]
    Unframed(String),

    /// Declared payload length runs past the end of the message.
    #[error("frame declares {declared} units but only {available} remain")]
    Truncated {
        /// Declared payload length.
        declared: usize,
        /// Units actually available.
        available: usize,
    },

    /// Payload is not a keepalive and not valid JSON.
    #[error("frame payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Keepalive beat; the payload after `~h~`.
    KeepAlive(String),
    /// JSON body.
    Message(Value),
}

/// Decode every frame in a raw socket message, keeping per-frame failures.
#[must_use]
pub fn decode_frames(raw: &str) -> Vec<Result<Packet, CodecError>> {
    let mut frames = Vec::new();
    let mut rest = raw;

    while !rest.is_empty() {
        let Some(start) = rest.find(FRAME_MARKER) else {
            frames.push(Err(CodecError::Unframed(preview(rest))));
            break;
        };
        if start > 0 {
            frames.push(Err(CodecError::Unframed(preview(&rest[..start]))));
        }

        let header = &rest[start + FRAME_MARKER.len()..];
        let digits = header.bytes().take_while(u8::is_ascii_digit).count();
        let declared = header[..digits].parse::<usize>().ok();

        let (Some(declared), true) = (declared, header[digits..].starts_with(FRAME_MARKER)) else {
            frames.push(Err(CodecError::MalformedHeader));
            rest = header;
            continue;
        };

        let body = &header[digits + FRAME_MARKER.len()..];
        let Some((payload, remainder)) = split_utf16(body, declared) else {
            frames.push(Err(CodecError::Truncated {
                declared,
                available: body.encode_utf16().count(),
            }));
            break;
        };

        frames.push(decode_payload(payload));
        rest = remainder;
    }

    frames
}

/// Decode every well-formed frame in a raw socket message, dropping the rest.
#[must_use]
pub fn parse_messages(raw: &str) -> Vec<Packet> {
    decode_frames(raw).into_iter().filter_map(Result::ok).collect()
}

/// Wrap a payload in a length header.
#[must_use]
pub fn prepend_header(payload: &str) -> String {
    format!(
        "{FRAME_MARKER}{}{FRAME_MARKER}{payload}",
        payload.encode_utf16().count()
    )
}

/// Build a framed `{"m": method, "p": params}` message.
#[must_use]
pub fn create_message(method: &str, params: &[Value]) -> String {
    prepend_header(&json!({ "m": method, "p": params }).to_string())
}

/// Build the framed echo for a keepalive beat.
#[must_use]
pub fn keepalive_frame(beat: &str) -> String {
    prepend_header(&format!("{KEEPALIVE_PREFIX}{beat}"))
}

fn decode_payload(payload: &str) -> Result<Packet, CodecError> {
    if let Some(beat) = payload.strip_prefix(KEEPALIVE_PREFIX) {
        return Ok(Packet::KeepAlive(beat.to_string()));
    }
    Ok(Packet::Message(serde_json::from_str(payload)?))
}

/// Split `s` after `units` UTF-16 code units.
fn split_utf16(s: &str, units: usize) -> Option<(&str, &str)> {
    if units == 0 {
        return Some(("", s));
    }

    let mut seen = 0;
    for (idx, ch) in s.char_indices() {
        seen += ch.len_utf16();
        if seen >= units {
            return Some(s.split_at(idx + ch.len_utf8()));
        }
    }
    None
}

fn preview(s: &str) -> String {
    s.chars().take(50).collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::{prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn decodes_single_message() {
        let raw = prepend_header(r#"{"m":"qsd","p":["qs_x",{}]}"#);
        let packets = parse_messages(&raw);
        assert_eq!(packets.len(), 1);
        let Packet::Message(value) = &packets[0] else {
            panic!("expected message");
        };
        assert_eq!(value["m"], "qsd");
    }

    #[test]
    fn decodes_concatenated_frames() {
        let raw = format!(
            "{}{}{}",
            prepend_header(r#"{"a":1}"#),
            keepalive_frame("3"),
            prepend_header(r#"{"b":2}"#)
        );
        let packets = parse_messages(&raw);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[1], Packet::KeepAlive("3".to_string()));
        assert_eq!(packets[2], Packet::Message(json!({"b": 2})));
    }

    #[test]
    fn keepalive_round_trips_verbatim() {
        let packets = parse_messages("~m~4~m~~h~1");
        assert_eq!(packets, vec![Packet::KeepAlive("1".to_string())]);
        assert_eq!(keepalive_frame("1"), "~m~4~m~~h~1");
    }

    #[test]
    fn session_handshake_frame() {
        let raw = prepend_header(r#"{"session_id":"<0.1.2>_abc","timestamp":1700}"#);
        let packets = parse_messages(&raw);
        let Packet::Message(value) = &packets[0] else {
            panic!("expected message");
        };
        assert_eq!(value["session_id"], "<0.1.2>_abc");
    }

    #[test]
    fn malformed_json_is_dropped_and_parsing_continues() {
        let raw = format!(
            "{}{}{}",
            prepend_header(r#"{"ok":1}"#),
            prepend_header("{not json"),
            prepend_header(r#"{"ok":2}"#)
        );
        let frames = decode_frames(&raw);
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[1], Err(CodecError::Json(_))));
        assert_eq!(parse_messages(&raw).len(), 2);
    }

    #[test]
    fn bad_header_skips_to_next_marker() {
        let raw = format!("~m~xx~m~garbage{}", prepend_header(r#"{"ok":true}"#));
        let packets = parse_messages(&raw);
        assert_eq!(packets, vec![Packet::Message(json!({"ok": true}))]);
    }

    #[test]
    fn truncated_frame_reports_error() {
        let frames = decode_frames(r#"~m~100~m~{"short":1}"#);
        assert!(matches!(
            frames.as_slice(),
            [Err(CodecError::Truncated { declared: 100, .. })]
        ));
    }

    #[test]
    fn unframed_text_is_reported() {
        let frames = decode_frames("hello");
        assert!(matches!(frames.as_slice(), [Err(CodecError::Unframed(_))]));
        assert!(parse_messages("").is_empty());
    }

    #[test]
    fn length_counts_utf16_units() {
        // "é" is one unit, the emoji is a surrogate pair.
        let payload = r#"{"n":"é😀"}"#;
        let framed = prepend_header(payload);
        assert!(framed.starts_with("~m~11~m~"));

        let twice = format!("{framed}{framed}");
        assert_eq!(parse_messages(&twice).len(), 2);
    }

    #[test]
    fn create_message_layout() {
        let msg = create_message("set_auth_token", &[json!("x")]);
        assert_eq!(msg, r#"~m~32~m~{"m":"set_auth_token","p":["x"]}"#);
    }

    proptest! {
        #[test]
        fn concatenated_frames_survive_any_text(texts in proptest::collection::vec(".*", 1..5)) {
            let raw: String = texts
                .iter()
                .map(|t| create_message("qsd", &[json!(t)]))
                .collect();
            let packets = parse_messages(&raw);
            prop_assert_eq!(packets.len(), texts.len());
            for (packet, text) in packets.iter().zip(&texts) {
                prop_assert_eq!(packet, &Packet::Message(json!({"m": "qsd", "p": [text]})));
            }
        }
    }
}
