//! Wire types for the duckchat endpoints.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Part {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<Part>>,
}

/// Body of `POST /duckchat/v1/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "canUseTools")]
    pub can_use_tools: bool,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            can_use_tools: false,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn add_message(
        &mut self,
        role: impl Into<String>,
        content: impl Into<String>,
        parts: Option<Vec<Part>>,
    ) {
        self.messages.push(ChatMessage {
            role: role.into(),
            content: serde_json::Value::String(content.into()),
            parts,
        });
    }
}

/// One `data:` event of the chat stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_upstream_field_names() {
        let mut request = ChatRequest::new("gpt-4o-mini");
        request.add_message("user", "hi", None);
        request.add_message("assistant", "hello", Some(vec![Part::text("hello")]));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["canUseTools"], false);
        assert!(json["metadata"].as_object().unwrap().is_empty());
        assert_eq!(json["messages"][0]["content"], "hi");
        assert!(json["messages"][0].get("parts").is_none());
        assert_eq!(json["messages"][1]["parts"][0]["type"], "text");
    }

    #[test]
    fn response_tolerates_missing_fields() {
        let event: ApiResponse = serde_json::from_str(r#"{"action":"success"}"#).unwrap();
        assert_eq!(event.action, "success");
        assert!(event.message.is_empty());
    }

    #[test]
    fn response_skips_fields_the_relay_never_reads() {
        let event: ApiResponse = serde_json::from_str(
            r#"{"action":"success","message":"hi","model":"gpt","role":"assistant","id":"x","created":1}"#,
        )
        .unwrap();
        assert_eq!(event.message, "hi");
        assert_eq!(event.model, "gpt");
    }
}
