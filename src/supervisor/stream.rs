//! Events from the lead agent's stream-json output.
//!
//! The lead process emits one JSON object per stdout line. Only a handful of
//! event kinds matter to the supervisor; anything that fails to parse is
//! logged raw by the caller.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

/// Extract a short human-readable description from a tool use event.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path("file_path")),
        "Write" => format!("Writing: {}", path("file_path")),
        "Edit" => format!("Editing: {}", path("file_path")),
        "Bash" => {
            let cmd = input.get("command").and_then(|v| v.as_str()).unwrap_or("command");
            format!("Running: {}", truncate(cmd, 80))
        }
        other => {
            let summary = input
                .get("description")
                .or_else(|| input.get("prompt"))
                .and_then(|v| v.as_str())
                .map(|s| truncate(s, 80))
                .unwrap_or_default();
            if summary.is_empty() {
                format!("Tool: {}", other)
            } else {
                format!("{}: {}", other, summary)
            }
        }
    }
}

/// Keep only the last two path components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.rsplitn(3, '/').collect();
    match parts.as_slice() {
        [file, dir, _rest] => format!("{}/{}", dir, file),
        _ => path.to_string(),
    }
}

/// Truncate to `max` characters on a char boundary, appending an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max).collect();
    format!("{}...", cut.trim_end())
}
