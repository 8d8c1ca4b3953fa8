//! Capability-list normalization.
//!
//! Servers (and SDKs in front of them) return list results in several
//! shapes: a bare array, an object wrapping the array under a known key, or
//! something else entirely. Every list goes through [`extract_list`], which
//! applies one fixed precedence: array, then wrapper key, then empty.

use serde_json::Value;

use super::types::{PromptArgument, ServicePrompt, ServiceResource, ServiceTool};

/// Name used when a tool entry has none.
pub const UNKNOWN_TOOL_NAME: &str = "Unknown Tool";

/// Wrapper keys for each list method.
pub const TOOLS_KEY: &str = "tools";
pub const RESOURCES_KEY: &str = "resources";
pub const PROMPTS_KEY: &str = "prompts";

/// Pull the item array out of a raw list result.
pub fn extract_list(raw: Value, wrapper_key: &str) -> Vec<Value> {
    match raw {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(wrapper_key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// First string value found under any of `keys`.
fn string_field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object"})
}

/// Normalize a raw `tools/list` result.
pub fn normalize_tools(raw: Value) -> Vec<ServiceTool> {
    extract_list(raw, TOOLS_KEY)
        .into_iter()
        .map(|item| {
            // Some servers list bare tool names.
            if let Value::String(name) = item {
                return ServiceTool {
                    name,
                    description: String::new(),
                    input_schema: default_schema(),
                };
            }
            ServiceTool {
                name: string_field(&item, &["name"]).unwrap_or_else(|| UNKNOWN_TOOL_NAME.into()),
                description: string_field(&item, &["description"]).unwrap_or_default(),
                input_schema: ["inputSchema", "input_schema", "parameters"]
                    .iter()
                    .find_map(|k| item.get(*k))
                    .cloned()
                    .unwrap_or_else(default_schema),
            }
        })
        .collect()
}

/// Normalize a raw `resources/list` result.
pub fn normalize_resources(raw: Value) -> Vec<ServiceResource> {
    extract_list(raw, RESOURCES_KEY)
        .into_iter()
        .map(|item| ServiceResource {
            uri: string_field(&item, &["uri"]).unwrap_or_default(),
            name: string_field(&item, &["name"]).unwrap_or_default(),
            description: string_field(&item, &["description"]).unwrap_or_default(),
            mime_type: string_field(&item, &["mimeType", "mime_type"]),
        })
        .collect()
}

/// Normalize a raw `prompts/list` result.
pub fn normalize_prompts(raw: Value) -> Vec<ServicePrompt> {
    extract_list(raw, PROMPTS_KEY)
        .into_iter()
        .map(|item| {
            let arguments = item
                .get("arguments")
                .and_then(Value::as_array)
                .map(|args| {
                    args.iter()
                        .map(|arg| PromptArgument {
                            name: string_field(arg, &["name"]).unwrap_or_default(),
                            description: string_field(arg, &["description"]).unwrap_or_default(),
                            required: arg.get("required").and_then(Value::as_bool).unwrap_or(false),
                        })
                        .collect()
                })
                .unwrap_or_default();
            ServicePrompt {
                name: string_field(&item, &["name"]).unwrap_or_default(),
                description: string_field(&item, &["description"]).unwrap_or_default(),
                arguments,
            }
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
