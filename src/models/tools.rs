use serde::{Deserialize, Serialize};

use crate::obfuscate::obfuscate;

/// One text block of a tool response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        ToolContent {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// A tool invocation outcome. Success carries the structured payload the
/// tool's output schema declares (wrapped as `{result: …}`); errors carry
/// only redacted text.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolResponse {
    Success {
        content: Vec<ToolContent>,
        #[serde(rename = "structuredContent")]
        structured_content: serde_json::Value,
    },
    Error {
        content: Vec<ToolContent>,
        #[serde(rename = "isError")]
        is_error: bool,
    },
}

impl ToolResponse {
    pub fn success(result: serde_json::Value) -> Self {
        let text =
            serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
        ToolResponse::Success {
            content: vec![ToolContent::text(text)],
            structured_content: serde_json::json!({ "result": result }),
        }
    }

    /// Build an error response. The message always passes through the
    /// credential obfuscator before leaving the process.
    pub fn error(message: impl AsRef<str>) -> Self {
        ToolResponse::Error {
            content: vec![ToolContent::text(obfuscate(message.as_ref()))],
            is_error: true,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolResponse::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let response = ToolResponse::success(json!({"rows": []}));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["structuredContent"]["result"]["rows"], json!([]));
        assert!(value.get("isError").is_none());
    }

    #[test]
    fn test_error_is_redacted() {
        let response =
            ToolResponse::error("connect failed: postgresql://u:hunter2@db/app");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["isError"], true);
        let text = value["content"][0]["text"].as_str().unwrap();
        assert!(text.contains(":****@"));
        assert!(!text.contains("hunter2"));
    }
}
