//! Newline-delimited JSON-RPC codec.
//!
//! Encoding is total: every outbound message is built as a
//! `serde_json::Value` and rendered with its infallible `Display` impl.
//! Decoding classifies one inbound line as a response, a notification or a
//! server-initiated request. Empty lines never reach the decoder.

use serde_json::{json, Map, Value};

use super::errors::McpError;
use super::types::{JsonRpcError, ServerMessage, JSONRPC_VERSION};

/// Longest slice of a bad line kept in a `DecodeError`.
const MAX_RAW_IN_ERROR: usize = 512;

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// Reply to one of our requests. `Err` holds the JSON-RPC error object.
    Response {
        id: u64,
        outcome: Result<Value, JsonRpcError>,
    },
    /// Anything the server sent unprompted.
    Unsolicited(ServerMessage),
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Encode a request as one newline-terminated JSON object.
pub fn encode_request(id: u64, method: &str, params: Option<&Value>) -> Vec<u8> {
    let mut msg = Map::new();
    msg.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
    msg.insert("id".into(), json!(id));
    msg.insert("method".into(), json!(method));
    if let Some(params) = params {
        msg.insert("params".into(), params.clone());
    }
    finish_line(Value::Object(msg))
}

/// Encode a notification (no `id`, no reply expected).
pub fn encode_notification(method: &str, params: Option<&Value>) -> Vec<u8> {
    let mut msg = Map::new();
    msg.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
    msg.insert("method".into(), json!(method));
    if let Some(params) = params {
        msg.insert("params".into(), params.clone());
    }
    finish_line(Value::Object(msg))
}

fn finish_line(msg: Value) -> Vec<u8> {
    // Compact rendering escapes embedded newlines, so this is one line.
    let mut out = msg.to_string().into_bytes();
    out.push(b'\n');
    out
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Decode one line received from the server.
///
/// Inbound `jsonrpc` tags are not enforced; some servers omit them.
pub fn decode_message(line: &[u8]) -> Result<DecodedMessage, McpError> {
    let value: Value = serde_json::from_slice(line)
        .map_err(|e| decode_error(line, format!("invalid JSON: {e}")))?;

    let Value::Object(mut obj) = value else {
        return Err(decode_error(line, "not a JSON object"));
    };

    let id = obj.remove("id").filter(|v| !v.is_null());

    if let Some(method) = obj.get("method").and_then(Value::as_str).map(String::from) {
        let params = obj.remove("params");
        let msg = match id {
            Some(id) => ServerMessage::Request { id, method, params },
            None => ServerMessage::Notification { method, params },
        };
        return Ok(DecodedMessage::Unsolicited(msg));
    }

    let Some(id) = id else {
        return Err(decode_error(line, "message has neither 'id' nor 'method'"));
    };
    let id = parse_id(&id).ok_or_else(|| decode_error(line, format!("unsupported id {id}")))?;

    if let Some(err) = obj.remove("error").filter(|v| !v.is_null()) {
        return Ok(DecodedMessage::Response {
            id,
            outcome: Err(parse_error_object(err)),
        });
    }

    match obj.remove("result") {
        Some(result) => Ok(DecodedMessage::Response {
            id,
            outcome: Ok(result),
        }),
        None => Err(decode_error(line, "response has neither 'result' nor 'error'")),
    }
}

/// Our ids are integers, but tolerate servers that echo them as strings.
fn parse_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_error_object(err: Value) -> JsonRpcError {
    match serde_json::from_value::<JsonRpcError>(err.clone()) {
        Ok(parsed) => parsed,
        Err(_) => JsonRpcError {
            code: 0,
            message: match &err {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            data: Some(err),
        },
    }
}

fn decode_error(line: &[u8], reason: impl Into<String>) -> McpError {
    let mut raw = String::from_utf8_lossy(line).into_owned();
    if raw.len() > MAX_RAW_IN_ERROR {
        let mut cut = MAX_RAW_IN_ERROR;
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        raw.truncate(cut);
        raw.push_str("...(truncated)");
    }
    McpError::DecodeError {
        raw,
        reason: reason.into(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_shape() {
        let line = encode_request(1, "initialize", None);
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let v: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 1);
        assert_eq!(v["method"], "initialize");
        // params omitted when None
        assert!(v.get("params").is_none());
    }

    #[test]
    fn test_encode_request_escapes_newlines_in_params() {
        let params = json!({"name": "fill", "arguments": {"value": "line one\nline two"}});
        let line = encode_request(7, "tools/call", Some(&params));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let v: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v["params"]["arguments"]["value"], "line one\nline two");
    }

    #[test]
    fn test_encode_notification_has_no_id() {
        let line = encode_notification("notifications/initialized", None);
        let v: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["method"], "notifications/initialized");
        assert!(v.get("id").is_none());
    }

    #[test]
    fn test_decode_success_response() {
        let msg = decode_message(br#"{"jsonrpc":"2.0","id":4,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(
            msg,
            DecodedMessage::Response {
                id: 4,
                outcome: Ok(json!({"tools": []})),
            }
        );
    }

    #[test]
    fn test_decode_response_without_jsonrpc_tag() {
        let msg = decode_message(br#"{"id":1,"result":{"tools":[{"name":"ping"}]}}"#).unwrap();
        assert!(matches!(msg, DecodedMessage::Response { id: 1, outcome: Ok(_) }));
    }

    #[test]
    fn test_decode_null_result_is_success() {
        let msg = decode_message(br#"{"jsonrpc":"2.0","id":2,"result":null}"#).unwrap();
        assert_eq!(
            msg,
            DecodedMessage::Response {
                id: 2,
                outcome: Ok(Value::Null),
            }
        );
    }

    #[test]
    fn test_decode_error_response_wins_over_null_result() {
        let line = br#"{"jsonrpc":"2.0","id":2,"result":null,"error":{"code":-32601,"message":"Method not found"}}"#;
        match decode_message(line).unwrap() {
            DecodedMessage::Response { id, outcome: Err(err) } => {
                assert_eq!(id, 2);
                assert_eq!(err.code, -32601);
                assert_eq!(err.message, "Method not found");
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_non_object_error_member() {
        let line = br#"{"id":3,"error":"kaput"}"#;
        match decode_message(line).unwrap() {
            DecodedMessage::Response { outcome: Err(err), .. } => {
                assert_eq!(err.message, "kaput");
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_string_id() {
        let msg = decode_message(br#"{"id":"9","result":{}}"#).unwrap();
        assert!(matches!(msg, DecodedMessage::Response { id: 9, .. }));
    }

    #[test]
    fn test_decode_notification() {
        let line = br#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#;
        assert_eq!(
            decode_message(line).unwrap(),
            DecodedMessage::Unsolicited(ServerMessage::Notification {
                method: "notifications/tools/list_changed".into(),
                params: None,
            })
        );
    }

    #[test]
    fn test_decode_server_request() {
        let line = br#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#;
        match decode_message(line).unwrap() {
            DecodedMessage::Unsolicited(ServerMessage::Request { id, method, .. }) => {
                assert_eq!(id, json!("srv-1"));
                assert_eq!(method, "ping");
            }
            other => panic!("expected server request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_json_keeps_raw_line() {
        let err = decode_message(b"Server listening on stdio").unwrap_err();
        match err {
            McpError::DecodeError { raw, reason } => {
                assert_eq!(raw, "Server listening on stdio");
                assert!(reason.contains("invalid JSON"));
            }
            other => panic!("expected DecodeError, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_shapeless_objects() {
        assert!(matches!(
            decode_message(br#"{"jsonrpc":"2.0"}"#),
            Err(McpError::DecodeError { .. })
        ));
        assert!(matches!(
            decode_message(br#"{"id":5}"#),
            Err(McpError::DecodeError { .. })
        ));
        assert!(matches!(
            decode_message(br#"[1,2,3]"#),
            Err(McpError::DecodeError { .. })
        ));
        assert!(matches!(
            decode_message(br#"{"id":{"nested":true},"result":1}"#),
            Err(McpError::DecodeError { .. })
        ));
    }

    #[test]
    fn test_decode_error_truncates_long_lines() {
        let long = "x".repeat(MAX_RAW_IN_ERROR * 3);
        match decode_message(long.as_bytes()).unwrap_err() {
            McpError::DecodeError { raw, .. } => {
                assert!(raw.len() < long.len());
                assert!(raw.ends_with("...(truncated)"));
            }
            other => panic!("expected DecodeError, got {other:?}"),
        }
    }
}
