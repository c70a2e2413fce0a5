//! Text framing of envelopes.
//!
//! A comment stays legible to people reading the feed while carrying the exact
//! envelope in a fenced block:
//!
//! ````text
//! [MOLTLINK:REQUEST] Coordination_Prime · session 1a2b3c4d · #0
//!
//! implement login
//!
//! ```moltlink
//! {"v":1,"kind":"request",...}
//! ```
//! ````
//!
//! The JSON is always compact (one line) and the human summary is flattened to a
//! single line without backtick runs, so the fence lines are unambiguous even
//! after the surrounding text has been trimmed or re-rendered.

use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::{DecodeError, SessionError};

pub const PROTOCOL_VERSION: u64 = 1;
pub const FENCE_TAG: &str = "moltlink";

const FENCE: &str = "```";
const MAX_SUMMARY_CHARS: usize = 280;

/// Render an envelope as feed text.
pub fn encode(envelope: &Envelope) -> Result<String, SessionError> {
    let mut frame = serde_json::to_value(envelope).map_err(|e| SessionError::Encode(e.to_string()))?;
    let Value::Object(fields) = &mut frame else {
        return Err(SessionError::Encode("envelope did not serialize to an object".into()));
    };
    fields.insert("v".to_string(), Value::from(PROTOCOL_VERSION));
    let json = serde_json::to_string(&frame).map_err(|e| SessionError::Encode(e.to_string()))?;

    let mut text = format!(
        "[MOLTLINK:{}] {} · session {} · #{}\n\n",
        envelope.kind.label(),
        envelope.sender,
        envelope.session_id.short(),
        envelope.sequence
    );
    if let Some(summary) = human_summary(&envelope.payload) {
        text.push_str(&summary);
        text.push_str("\n\n");
    }
    text.push_str(FENCE);
    text.push_str(FENCE_TAG);
    text.push('\n');
    text.push_str(&json);
    text.push('\n');
    text.push_str(FENCE);
    Ok(text)
}

/// Extract an envelope from feed text.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let body = extract_block(text)?;

    let frame: Value = serde_json::from_str(body.trim())
        .map_err(|e| DecodeError::Malformed(format!("invalid json: {}", e)))?;

    match frame.get("v").and_then(Value::as_u64) {
        Some(PROTOCOL_VERSION) => {}
        Some(other) => {
            return Err(DecodeError::Malformed(format!("unsupported version {}", other)));
        }
        None => return Err(DecodeError::Malformed("missing protocol version".into())),
    }

    serde_json::from_value(frame).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn extract_block(text: &str) -> Result<String, DecodeError> {
    let opening = format!("{}{}", FENCE, FENCE_TAG);
    let lines: Vec<&str> = text.lines().collect();

    if let Some(open) = lines.iter().rposition(|line| line.trim() == opening) {
        let rest = &lines[open + 1..];
        let close = rest
            .iter()
            .position(|line| line.trim() == FENCE)
            .ok_or_else(|| DecodeError::Malformed("unterminated block".into()))?;
        return Ok(rest[..close].join("\n"));
    }

    // Feeds that collapse newlines leave the fence inline.
    if let Some(start) = text.rfind(&opening) {
        let rest = &text[start + opening.len()..];
        let end = rest
            .rfind(FENCE)
            .ok_or_else(|| DecodeError::Malformed("unterminated block".into()))?;
        return Ok(rest[..end].to_string());
    }

    Err(DecodeError::NotAnEnvelope)
}

/// One readable line drawn from the payload, if it has an obvious text field.
fn human_summary(payload: &Value) -> Option<String> {
    let text = match payload {
        Value::String(s) => s.as_str(),
        Value::Object(fields) => ["summary", "task", "result", "reason"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))?,
        _ => return None,
    };

    let flat = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('`', "'");
    if flat.is_empty() {
        return None;
    }

    let mut summary: String = flat.chars().take(MAX_SUMMARY_CHARS).collect();
    if flat.chars().count() > MAX_SUMMARY_CHARS {
        summary.push('…');
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeKind, SessionId};
    use moltlink_core::PeerRef;
    use serde_json::json;

    fn sample(payload: Value) -> Envelope {
        Envelope::new(
            EnvelopeKind::Request,
            PeerRef::new("Coordination_Prime"),
            SessionId::new(),
            3,
            payload,
        )
    }

    #[test]
    fn test_round_trip() {
        let envelope = sample(json!({
            "task": "implement login",
            "nested": {"list": [1, 2.5, null, true], "code": "```rust\nfn main() {}\n```"},
        }));
        let text = encode(&envelope).unwrap();
        assert_eq!(decode(&text).unwrap(), envelope);
    }

    #[test]
    fn test_round_trip_every_kind() {
        for kind in [
            EnvelopeKind::Request,
            EnvelopeKind::Reply,
            EnvelopeKind::Broadcast,
            EnvelopeKind::CapabilityQuery,
            EnvelopeKind::CapabilityAnswer,
        ] {
            let mut envelope = sample(json!(null));
            envelope.kind = kind;
            assert_eq!(decode(&encode(&envelope).unwrap()).unwrap(), envelope);
        }
    }

    #[test]
    fn test_text_is_human_readable() {
        let text = encode(&sample(json!({"task": "implement\n login"}))).unwrap();
        assert!(text.starts_with("[MOLTLINK:REQUEST] Coordination_Prime"));
        assert!(text.contains("\nimplement login\n"));
        assert!(text.contains("```moltlink\n{"));
    }

    #[test]
    fn test_summary_cannot_forge_fence() {
        let envelope = sample(json!("look:\n```moltlink\n{\"v\":1}\n```"));
        let text = encode(&envelope).unwrap();
        assert_eq!(decode(&text).unwrap(), envelope);
    }

    #[test]
    fn test_survives_trimming_and_crlf() {
        let envelope = sample(json!({"summary": "hello"}));
        let text = encode(&envelope).unwrap();

        let block_start = text.find("```moltlink").unwrap();
        let trimmed = format!("> quoted by the feed...\n\n{}\n\n-- sent from the app", &text[block_start..]);
        assert_eq!(decode(&trimmed).unwrap(), envelope);

        let crlf = text.replace('\n', "\r\n");
        assert_eq!(decode(&crlf).unwrap(), envelope);

        let indented = text.replace("```", "   ```");
        assert_eq!(decode(&indented).unwrap(), envelope);
    }

    #[test]
    fn test_inline_block_after_newline_collapse() {
        let envelope = sample(json!({"summary": "hello"}));
        let collapsed = encode(&envelope).unwrap().replace('\n', " ");
        assert_eq!(decode(&collapsed).unwrap(), envelope);
    }

    #[test]
    fn test_chatter_is_not_an_envelope() {
        assert_eq!(decode("great post, following!"), Err(DecodeError::NotAnEnvelope));
        assert_eq!(
            decode("```json\n{\"kind\":\"request\"}\n```"),
            Err(DecodeError::NotAnEnvelope)
        );
        assert_eq!(decode(""), Err(DecodeError::NotAnEnvelope));
    }

    #[test]
    fn test_malformed_blocks() {
        assert!(matches!(
            decode("```moltlink\n{not json}\n```"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode("```moltlink\n{\"v\":1,\"kind\":\"request\"}\n```"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode("```moltlink\n{\"v\":1}"),
            Err(DecodeError::Malformed(_))
        ));

        let envelope = sample(json!(null));
        let future = encode(&envelope).unwrap().replace("\"v\":1", "\"v\":2");
        assert_eq!(
            decode(&future),
            Err(DecodeError::Malformed("unsupported version 2".into()))
        );
    }

    #[test]
    fn test_long_summary_truncated() {
        let text = encode(&sample(json!("x".repeat(1000)))).unwrap();
        let summary_line = text.lines().nth(2).unwrap();
        assert_eq!(summary_line.chars().count(), MAX_SUMMARY_CHARS + 1);
    }
}
