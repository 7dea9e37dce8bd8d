use serde::{Deserialize, Serialize};

/// Normalized result of one load-generator invocation.
///
/// Metrics an adapter cannot derive stay `None`; they are never reported as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool: String,
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<u64>,
    pub raw: serde_json::Value,
}

impl ToolResult {
    pub fn new(tool: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            method: method.into(),
            url: url.into(),
            average_latency_ms: None,
            requests_per_second: None,
            errors: None,
            raw: serde_json::Value::Null,
        }
    }
}
