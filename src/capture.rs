use chrono::DateTime;
use serde_json::Value;

use crate::protocol::PushMessage;
use crate::transcript::TranscriptLine;

/// One line of a traffic capture file.
///
/// A capture holds, one per line, either a raw push message (`{"type": ...}`), an envelope
/// `{"receivedAt": <RFC 3339 or epoch ms>, "message": {...}}`, or a plain rendered chat line.
#[derive(Debug, Clone)]
pub enum CaptureLine {
    Push {
        received_at_ms: Option<i64>,
        message: PushMessage,
    },
    Transcript(TranscriptLine),
    Blank,
}

pub fn parse_capture_line(line: &str) -> Result<CaptureLine, String> {
    let trimmed_line = line.trim();
    if trimmed_line.is_empty() {
        return Ok(CaptureLine::Blank);
    }
    if !trimmed_line.starts_with('{') {
        return Ok(CaptureLine::Transcript(TranscriptLine::new(trimmed_line)));
    }

    let value = serde_json::from_str::<Value>(trimmed_line)
        .map_err(|error| format!("Failed to parse capture line: {error}"))?;

    let (received_at_ms, message_value) = match value.get("message") {
        Some(message) if value.get("type").is_none() => {
            (value.get("receivedAt").and_then(parse_received_at), message.clone())
        }
        _ => (None, value),
    };

    let message = serde_json::from_value::<PushMessage>(message_value)
        .map_err(|error| format!("Failed to decode captured push message: {error}"))?;

    Ok(CaptureLine::Push {
        received_at_ms,
        message,
    })
}

fn parse_received_at(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|timestamp| timestamp.timestamp_millis()),
        _ => None,
    }
}
