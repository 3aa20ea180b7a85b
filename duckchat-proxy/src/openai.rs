//! OpenAI chat-completions shapes and the translation into duckchat requests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DEFAULT_MODEL;
use crate::error::{ProxyError, Result};
use crate::types::{ChatRequest, Part};

/// Upstream model ids the proxy advertises on `/v1/models`.
pub const SUPPORTED_MODELS: &[&str] = &[
    "gpt-4o-mini",
    "gpt-5-mini",
    "o3-mini",
    "claude-3-5-haiku-latest",
    "meta-llama/Llama-4-Scout-17B-16E-Instruct",
    "mistralai/Mistral-Small-24B-Instruct-2501",
];

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatCompletionResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponseMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunkChoice {
    pub index: u32,
    pub delta: ChatCompletionChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChatCompletionChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl ChatCompletionChunk {
    fn single(model: &str, delta: ChatCompletionChunkDelta, finish_reason: Option<String>) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion.chunk".to_string(),
            created: unix_now(),
            model: model.to_string(),
            choices: vec![ChatCompletionChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

impl std::fmt::Display for ChatCompletionChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(&json)
    }
}

/// Content delta chunk.
pub fn new_chunk(text: &str, model: &str) -> ChatCompletionChunk {
    ChatCompletionChunk::single(
        model,
        ChatCompletionChunkDelta {
            role: Some("assistant".to_string()),
            content: Some(text.to_string()),
        },
        None,
    )
}

/// Terminal chunk with an empty delta.
pub fn stop_chunk(reason: &str, model: &str) -> ChatCompletionChunk {
    ChatCompletionChunk::single(
        model,
        ChatCompletionChunkDelta::default(),
        Some(reason.to_string()),
    )
}

impl ChatCompletionResponse {
    pub fn from_text(content: String, model: &str) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: model.to_string(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ChatCompletionResponseMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: Some("stop".to_string()),
            }],
        }
    }
}

impl ModelList {
    pub fn supported() -> Self {
        let created = unix_now();
        Self {
            object: "list".to_string(),
            data: SUPPORTED_MODELS
                .iter()
                .map(|id| ModelEntry {
                    id: id.to_string(),
                    object: "model".to_string(),
                    created,
                    owned_by: "duckduckgo".to_string(),
                })
                .collect(),
        }
    }
}

/// Map the model names clients commonly send onto duckchat model ids.
pub fn resolve_model(requested: Option<&str>) -> String {
    let requested = match requested.map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => return DEFAULT_MODEL.to_string(),
    };
    let lower = requested.to_ascii_lowercase();

    if lower.starts_with("claude") {
        "claude-3-5-haiku-latest".to_string()
    } else if lower.contains("llama") {
        "meta-llama/Llama-4-Scout-17B-16E-Instruct".to_string()
    } else if lower.contains("mistral") || lower.contains("mixtral") {
        "mistralai/Mistral-Small-24B-Instruct-2501".to_string()
    } else {
        requested.to_string()
    }
}

/// Flatten OpenAI content (plain string or an array of typed parts) into text.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                serde_json::Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(|t| t.as_str()),
            })
            .collect(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Build the upstream request for an incoming chat completion.
pub fn convert_request(request: &ChatCompletionRequest) -> Result<ChatRequest> {
    if request.messages.is_empty() {
        return Err(ProxyError::BadRequest("messages must not be empty".to_string()));
    }

    let mut upstream = ChatRequest::new(resolve_model(request.model.as_deref()));
    for message in &request.messages {
        let text = content_text(&message.content);
        match message.role.as_str() {
            "assistant" => {
                let parts = vec![Part::text(text.clone())];
                upstream.add_message("assistant", text, Some(parts));
            }
            // duckchat only knows user and assistant turns
            _ => upstream.add_message("user", text, None),
        }
    }
    Ok(upstream)
}
