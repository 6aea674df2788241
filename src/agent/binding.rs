use serde_json::{Map, Value, json};
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::sources::Source;
use crate::db::tool_cache::SourceTool;
use crate::providers::base::ToolDefinition;

/// Name/description keywords marking a tool as search-like.
const SEARCH_KEYWORDS: &[&str] = &[
    "search", "get", "list", "find", "read", "fetch", "query", "lookup", "retrieve", "browse",
    "view", "show", "describe", "info",
];

/// Keywords marking a tool as destructive; these always exclude.
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "delete", "remove", "create", "update", "modify", "write", "post", "put", "patch", "edit",
    "change", "set", "insert", "add",
];

/// A cached tool bound for one query: the namespaced definition handed to
/// the LLM plus everything needed to route the call back out.
#[derive(Debug, Clone)]
pub struct BoundTool {
    pub namespaced_name: String,
    pub original_name: String,
    pub source_id: Uuid,
    pub source_name: String,
    pub server_url: String,
    pub auth_headers: HashMap<String, String>,
    pub definition: ToolDefinition,
}

/// Convert a source name into a safe identifier prefix: lowercase, any
/// non-alphanumeric character becomes `_`, leading/trailing `_` stripped.
pub fn sanitize_source_name(name: &str) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    lowered.trim_matches('_').to_string()
}

/// Normalize a cached JSON schema into the argument schema given to the
/// LLM. `null`, non-object, and empty schemas become a no-parameter tool.
pub fn normalize_schema(schema: &Value) -> Value {
    let properties = schema.get("properties").and_then(Value::as_object);
    let Some(properties) = properties.filter(|p| !p.is_empty()) else {
        return json!({"type": "object", "properties": {}});
    };

    let required: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| {
            r.iter()
                .filter_map(Value::as_str)
                .filter(|name| properties.contains_key(*name))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut out = Map::new();
    for (name, def) in properties {
        let declared = def.get("type").and_then(Value::as_str).unwrap_or("string");
        let mapped = match declared {
            "string" | "integer" | "number" | "boolean" | "array" | "object" => declared,
            _ => "string",
        };
        let mut prop = Map::new();
        prop.insert("type".into(), Value::String(mapped.to_string()));
        for key in ["description", "default", "enum", "items"] {
            if let Some(v) = def.get(key) {
                prop.insert(key.to_string(), v.clone());
            }
        }
        out.insert(name.clone(), Value::Object(prop));
    }

    let mut schema = json!({"type": "object", "properties": out});
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

/// Bind cached tools to their sources under namespaced names
/// (`<sanitized_source_name>_<original_tool_name>`).
pub fn bind_tools(sources: &[Source], cached: &[SourceTool]) -> Vec<BoundTool> {
    let mut bound = Vec::new();

    for tool in cached {
        let Some(source) = sources.iter().find(|s| s.source_id == tool.source_id) else {
            continue;
        };

        let prefix = sanitize_source_name(&source.name);
        let namespaced_name = format!("{}_{}", prefix, tool.tool_name);
        let description = format!(
            "[{}] {}",
            source.name,
            tool.description.clone().unwrap_or_else(|| format!(
                "Tool {} from {}",
                tool.tool_name, source.name
            ))
        );

        bound.push(BoundTool {
            namespaced_name: namespaced_name.clone(),
            original_name: tool.tool_name.clone(),
            source_id: source.source_id,
            source_name: source.name.clone(),
            server_url: source.server_url.clone(),
            auth_headers: source.auth_headers.clone(),
            definition: ToolDefinition {
                name: namespaced_name,
                description,
                parameters: normalize_schema(&tool.schema),
            },
        });
    }

    bound.sort_by(|a, b| a.namespaced_name.cmp(&b.namespaced_name));
    bound
}

/// Keep only search-like tools: something in the name or description must
/// look read-only, and nothing may look destructive.
pub fn filter_search_tools(tools: &[BoundTool]) -> Vec<BoundTool> {
    tools
        .iter()
        .filter(|tool| {
            let name = tool.namespaced_name.to_lowercase();
            let description = tool.definition.description.to_lowercase();
            let matches = |keywords: &[&str]| {
                keywords
                    .iter()
                    .any(|k| name.contains(k) || description.contains(k))
            };
            matches(SEARCH_KEYWORDS) && !matches(DESTRUCTIVE_KEYWORDS)
        })
        .cloned()
        .collect()
}

/// Look a namespaced name back up.
pub fn resolve<'a>(tools: &'a [BoundTool], namespaced_name: &str) -> Option<&'a BoundTool> {
    tools.iter().find(|t| t.namespaced_name == namespaced_name)
}
