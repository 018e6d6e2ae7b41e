//! JSON hub protocol framing: every message is a JSON document followed by
//! the ASCII record separator.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::TransportError;

pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const HANDSHAKE_REQUEST: &str = r#"{"protocol":"json","version":1}"#;

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
    },
    Unsupported(u8),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: Option<String>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    error: Option<String>,
}

pub fn frame(payload: &str) -> String {
    let mut framed = String::with_capacity(payload.len() + 1);
    framed.push_str(payload);
    framed.push(RECORD_SEPARATOR);
    framed
}

pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|chunk| !chunk.trim().is_empty())
}

pub fn invocation(invocation_id: &str, target: &str, arguments: &[Value]) -> String {
    let message = json!({
        "type": INVOCATION,
        "invocationId": invocation_id,
        "target": target,
        "arguments": arguments,
    });
    frame(&message.to_string())
}

pub fn parse_handshake(payload: &str) -> Result<(), TransportError> {
    let response: HandshakeResponse = serde_json::from_str(payload)
        .map_err(|err| TransportError::Handshake(format!("malformed handshake reply: {err}")))?;

    match response.error {
        Some(error) => Err(TransportError::Handshake(error)),
        None => Ok(()),
    }
}

pub fn parse_message(payload: &str) -> Result<HubMessage, serde_json::Error> {
    let raw: RawMessage = serde_json::from_str(payload)?;

    let message = match raw.kind {
        INVOCATION => HubMessage::Invocation {
            invocation_id: raw.invocation_id,
            target: raw.target.unwrap_or_default(),
            arguments: raw.arguments,
        },
        COMPLETION => HubMessage::Completion {
            invocation_id: raw.invocation_id.unwrap_or_default(),
            error: raw.error,
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close { error: raw.error },
        other => HubMessage::Unsupported(other),
    };

    Ok(message)
}

/// Extracts `(entity_id, lat, lng)` from `ReceiveLocation` arguments. The
/// entity id may arrive as a string or a number.
pub fn location_arguments(arguments: &[Value]) -> Option<(String, f64, f64)> {
    let [entity, lat, lng, ..] = arguments else {
        return None;
    };

    let entity_id = match entity {
        Value::String(id) => id.clone(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };

    Some((entity_id, lat.as_f64()?, lng.as_f64()?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn frames_are_terminated_and_split() {
        let text = format!("{}{}", frame("{}"), frame(r#"{"type":6}"#));
        let frames: Vec<&str> = split_frames(&text).collect();
        assert_eq!(frames, vec!["{}", r#"{"type":6}"#]);
    }

    #[test]
    fn handshake_error_is_reported() {
        assert!(parse_handshake("{}").is_ok());
        assert_eq!(
            parse_handshake(r#"{"error":"unsupported protocol"}"#),
            Err(TransportError::Handshake("unsupported protocol".to_string()))
        );
    }

    #[test]
    fn invocation_carries_id_and_arguments() {
        let framed = invocation("7", "Subscribe", &[json!("D1")]);
        assert!(framed.ends_with(RECORD_SEPARATOR));

        let body: serde_json::Value =
            serde_json::from_str(framed.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(body["type"], 1);
        assert_eq!(body["invocationId"], "7");
        assert_eq!(body["target"], "Subscribe");
        assert_eq!(body["arguments"][0], "D1");
    }

    #[test]
    fn parses_location_invocation() {
        let message = parse_message(
            r#"{"type":1,"target":"ReceiveLocation","arguments":["D1",10.05,106.05]}"#,
        )
        .unwrap();

        let HubMessage::Invocation { target, arguments, .. } = message else {
            panic!("expected invocation");
        };
        assert_eq!(target, "ReceiveLocation");
        assert_eq!(
            location_arguments(&arguments),
            Some(("D1".to_string(), 10.05, 106.05))
        );
    }

    #[test]
    fn numeric_entity_ids_are_accepted() {
        assert_eq!(
            location_arguments(&[json!(42), json!(1.5), json!(2.5)]),
            Some(("42".to_string(), 1.5, 2.5))
        );
        assert_eq!(location_arguments(&[json!("D1"), json!("x"), json!(2.5)]), None);
        assert_eq!(location_arguments(&[json!("D1")]), None);
    }

    #[test]
    fn parses_completion_ping_and_close() {
        assert_eq!(
            parse_message(r#"{"type":3,"invocationId":"2","error":"denied"}"#).unwrap(),
            HubMessage::Completion {
                invocation_id: "2".to_string(),
                error: Some("denied".to_string())
            }
        );
        assert_eq!(parse_message(r#"{"type":6}"#).unwrap(), HubMessage::Ping);
        assert_eq!(
            parse_message(r#"{"type":7}"#).unwrap(),
            HubMessage::Close { error: None }
        );
        assert_eq!(
            parse_message(r#"{"type":2,"invocationId":"1"}"#).unwrap(),
            HubMessage::Unsupported(2)
        );
    }
}
