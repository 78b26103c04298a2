use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Which relay surface a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Edits,
    ImageGenerations,
    AudioTranscription,
    AudioTts,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The OpenAI-style request shape used as the common tongue of the relay.
/// Unknown inbound fields are dropped on re-serialization, which only
/// happens when a model mapping forces a rewrite; otherwise the original
/// body bytes pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GeneralRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub prompt: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instruction: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub max_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// The canonical error payload, as OpenAI clients expect it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub param: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub code: Value,
}

#[derive(Debug)]
pub struct RelayError {
    pub status: StatusCode,
    pub error: OpenAiError,
}

impl RelayError {
    /// Wraps an internal failure into the canonical envelope with a stable
    /// machine-readable code.
    pub fn wrap(message: impl Into<String>, code: &str, status: StatusCode) -> Self {
        RelayError {
            status,
            error: OpenAiError {
                message: message.into(),
                error_type: "relay_hub_error".to_string(),
                param: String::new(),
                code: Value::String(code.to_string()),
            },
        }
    }

    pub fn from_upstream(status: StatusCode, error: OpenAiError) -> Self {
        RelayError { status, error }
    }

    pub fn envelope(&self) -> Value {
        json!({ "error": self.error })
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = self.envelope().to_string();
        Response::builder()
            .status(self.status)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResponseChoice {
    pub index: i64,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: String,
}

/// Canonical non-streaming completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub model: String,
    pub choices: Vec<TextResponseChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: i64,
    pub delta: StreamDelta,
    pub finish_reason: Option<String>,
}

/// Canonical streaming chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

impl StreamResponse {
    pub fn content_chunk(id: &str, model: &str, created: i64, content: String) -> Self {
        StreamResponse {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta {
                    role: None,
                    content: Some(content),
                },
                finish_reason: None,
            }],
        }
    }

    pub fn stop_chunk(id: &str, model: &str, created: i64) -> Self {
        StreamResponse {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta::default(),
                finish_reason: Some("stop".to_string()),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: String,
    pub index: i64,
    pub embedding: Vec<f64>,
}

/// Canonical embeddings response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_request_minimal_round_trip() {
        let raw = r#"{"model":"gpt-3.5-turbo","messages":[{"role":"user","content":"hi"}]}"#;
        let request: GeneralRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.model, "gpt-3.5-turbo");
        assert_eq!(request.messages.len(), 1);
        assert!(!request.stream);

        // Optional fields absent on input stay absent on output.
        let out = serde_json::to_value(&request).unwrap();
        assert_eq!(
            out,
            serde_json::json!({
                "model": "gpt-3.5-turbo",
                "messages": [{"role": "user", "content": "hi"}],
            })
        );
    }

    #[test]
    fn test_error_envelope_shape() {
        let err = RelayError::wrap("model is required", "required_field_missing", StatusCode::BAD_REQUEST);
        let envelope = err.envelope();
        assert_eq!(envelope["error"]["code"], "required_field_missing");
        assert_eq!(envelope["error"]["message"], "model is required");
        assert_eq!(envelope["error"]["type"], "relay_hub_error");
    }

    #[test]
    fn test_usage_totals() {
        let usage = Usage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }
}
