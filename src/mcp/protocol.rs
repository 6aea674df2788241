use serde::Deserialize;
use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Build a JSON-RPC 2.0 request envelope.
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a JSON-RPC 2.0 notification (no id, no response expected).
pub fn notification(method: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    })
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "scintilla",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// A tool definition as reported by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

/// Parse the `tools/list` result payload.
pub fn parse_tool_list(result: &Value) -> Vec<McpToolDef> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Flatten a `tools/call` result into one string: text-typed content parts
/// are concatenated, anything else is stringified. Returns the text and
/// whether the server flagged the result as a tool-level error.
pub fn flatten_call_result(result: &Value) -> (String, bool) {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut text = String::new();
    if let Some(parts) = result.get("content").and_then(Value::as_array) {
        for part in parts {
            if part.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(t) = part.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            } else {
                text.push_str(&part.to_string());
            }
        }
    }

    if text.is_empty() && result.get("content").is_none() {
        text = result.to_string();
    }

    (text, is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_shape() {
        let req = request(7, "tools/list", json!({}));
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["id"], 7);
        assert_eq!(req["method"], "tools/list");
    }

    #[test]
    fn notification_has_no_id() {
        let n = notification("notifications/initialized");
        assert!(n.get("id").is_none());
    }

    #[test]
    fn tool_list_parses_partial_schemas() {
        let result = json!({
            "tools": [
                {"name": "jira_search", "description": "Search", "inputSchema": {"type": "object"}},
                {"name": "bare_tool"},
            ]
        });
        let tools = parse_tool_list(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "jira_search");
        assert!(tools[1].description.is_none());
        assert!(tools[1].input_schema.is_none());
    }

    #[test]
    fn call_result_concatenates_text_parts() {
        let result = json!({
            "content": [
                {"type": "text", "text": "first "},
                {"type": "text", "text": "second"},
            ]
        });
        let (text, is_error) = flatten_call_result(&result);
        assert_eq!(text, "first second");
        assert!(!is_error);
    }

    #[test]
    fn call_result_stringifies_non_text_parts() {
        let result = json!({
            "content": [{"type": "image", "data": "…", "mimeType": "image/png"}],
            "isError": true
        });
        let (text, is_error) = flatten_call_result(&result);
        assert!(text.contains("image/png"));
        assert!(is_error);
    }
}
