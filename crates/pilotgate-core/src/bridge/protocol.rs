//! Line-delimited JSON-RPC 2.0 framing

use serde::Serialize;
use serde_json::Value;

use crate::tools::ToolError;

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

impl<'a> Request<'a> {
    pub(crate) fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub(crate) fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Serialize `message` as one newline-terminated line
pub(crate) fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// A decoded line from the subprocess
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Reply to one of our requests
    Response { id: u64, outcome: Result<Value, ToolError> },
    /// Request from the subprocess to us
    Request { id: Value, method: String },
    Notification { method: String },
}

/// Classify one line; `None` for anything that is not a JSON-RPC message
pub(crate) fn decode(line: &str) -> Result<Option<Incoming>, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    let method = value.get("method").and_then(Value::as_str).map(str::to_string);
    let id = value.get("id").filter(|id| !id.is_null()).cloned();

    let message = match (method, id) {
        (Some(method), Some(id)) => Some(Incoming::Request { id, method }),
        (Some(method), None) => Some(Incoming::Notification { method }),
        (None, Some(id)) => id.as_u64().map(|id| Incoming::Response {
            id,
            outcome: parse_outcome(&value),
        }),
        (None, None) => None,
    };
    Ok(message)
}

fn parse_outcome(response: &Value) -> Result<Value, ToolError> {
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        return Err(ToolError::Rpc { code, message });
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_layout() {
        let line = encode(&Request::new(7, "tools/call", json!({"name": "grep"}))).unwrap();
        let text = String::from_utf8(line).unwrap();
        assert_eq!(
            text,
            "{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"tools/call\",\"params\":{\"name\":\"grep\"}}\n"
        );

        let line = encode(&Notification::new("notifications/initialized", None)).unwrap();
        assert_eq!(
            String::from_utf8(line).unwrap(),
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n"
        );
    }

    #[test]
    fn test_decode_variants() {
        match decode(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap() {
            Some(Incoming::Response { id: 3, outcome: Ok(v) }) => assert_eq!(v, json!({"ok": true})),
            other => panic!("unexpected {:?}", other),
        }
        match decode(r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"nope"}}"#).unwrap() {
            Some(Incoming::Response {
                id: 4,
                outcome: Err(ToolError::Rpc { code, message }),
            }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            decode(r#"{"jsonrpc":"2.0","id":"a","method":"ping"}"#).unwrap(),
            Some(Incoming::Request { .. })
        ));
        assert!(matches!(
            decode(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#).unwrap(),
            Some(Incoming::Notification { .. })
        ));
        assert!(decode(r#"{"jsonrpc":"2.0"}"#).unwrap().is_none());
        assert!(decode("not json").is_err());
    }
}
