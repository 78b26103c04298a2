use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, StatusCode},
    response::Response,
};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::relay::settle::Settlement;
use crate::relay::token_count;
use crate::relay::types::{
    GeneralRequest, Message, OpenAiError, RelayError, StreamResponse, TextResponse,
    TextResponseChoice, Usage,
};
use crate::utils::sse::{SseEvent, SseParser};

pub fn full_url(base_url: &str) -> String {
    format!("{}/v1/complete", base_url)
}

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    prompt: String,
    max_tokens_to_sample: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ClaudeResponse {
    #[serde(default)]
    completion: String,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    error: ClaudeError,
}

#[derive(Debug, Deserialize, Default)]
struct ClaudeError {
    #[serde(default, rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

fn stop_reason_claude_to_openai(reason: &str) -> String {
    match reason {
        "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

/// Chat messages flattened onto the legacy Human/Assistant prompt protocol.
pub fn build_request_body(request: &GeneralRequest) -> Value {
    let mut prompt = String::new();
    for message in &request.messages {
        match message.role.as_str() {
            "user" => {
                prompt.push_str("\n\nHuman: ");
                prompt.push_str(&message.content);
            }
            "assistant" => {
                prompt.push_str("\n\nAssistant: ");
                prompt.push_str(&message.content);
            }
            // A system prompt leads without a speaker tag.
            _ => prompt.push_str(&message.content),
        }
    }
    prompt.push_str("\n\nAssistant:");

    let claude_request = ClaudeRequest {
        model: request.model.clone(),
        prompt,
        max_tokens_to_sample: if request.max_tokens == 0 {
            1_000_000
        } else {
            request.max_tokens
        },
        stop_sequences: request.stop.as_ref().and_then(|stop| match stop {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }),
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
    };
    serde_json::to_value(claude_request).unwrap_or(Value::Null)
}

pub async fn handler(
    response: reqwest::Response,
    prompt_tokens: i64,
    model: &str,
    settlement: Settlement,
) -> Result<Response<Body>, RelayError> {
    let body = response.bytes().await.map_err(|e| {
        RelayError::wrap(
            format!("failed to read upstream response body: {}", e),
            "read_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    let claude_response: ClaudeResponse = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if !claude_response.error.error_type.is_empty() {
        drop(settlement);
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: claude_response.error.message,
                error_type: claude_response.error.error_type,
                param: String::new(),
                code: Value::Null,
            },
        ));
    }

    let completion_tokens = token_count::count_text(&claude_response.completion, model);
    let usage = Usage::new(prompt_tokens, completion_tokens);
    let text_response = TextResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: String::new(),
        choices: vec![TextResponseChoice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content: claude_response.completion.trim_start().to_string(),
                name: None,
            },
            finish_reason: stop_reason_claude_to_openai(&claude_response.stop_reason),
        }],
        usage,
    };
    settlement.complete(usage);

    let body = serde_json::to_vec(&text_response).map_err(|e| {
        RelayError::wrap(
            format!("failed to serialize response: {}", e),
            "marshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap())
}

pub fn stream_handler(
    response: reqwest::Response,
    model: &str,
    prompt_tokens: i64,
    settlement: Settlement,
) -> Response<Body> {
    let model = model.to_string();
    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut response_text = String::new();
        let settlement = settlement;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in parser.process(&chunk) {
                        let Ok(claude_response) = serde_json::from_str::<ClaudeResponse>(&event.data) else {
                            continue;
                        };
                        response_text.push_str(&claude_response.completion);
                        let frame = StreamResponse::content_chunk(
                            &id,
                            &model,
                            created,
                            claude_response.completion,
                        );
                        match serde_json::to_string(&frame) {
                            Ok(data) => yield Ok::<_, std::io::Error>(SseEvent::data(data).to_bytes()),
                            Err(e) => error!("failed to serialize stream chunk: {}", e),
                        }
                    }
                }
                Err(e) => {
                    error!("upstream stream error: {}", e);
                    let envelope = RelayError::wrap(
                        format!("upstream stream error: {}", e),
                        "stream_read_failed",
                        StatusCode::BAD_GATEWAY,
                    );
                    yield Ok(SseEvent::data(envelope.envelope().to_string()).to_bytes());
                    break;
                }
            }
        }

        if let Ok(data) = serde_json::to_string(&StreamResponse::stop_chunk(&id, &model, created)) {
            yield Ok(SseEvent::data(data).to_bytes());
        }
        yield Ok(SseEvent::data("[DONE]").to_bytes());

        let completion_tokens = token_count::count_text(&response_text, &model);
        settlement.complete(Usage::new(prompt_tokens, completion_tokens));
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(stream))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_prompt_flattening() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "claude-2",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "bye"}
            ],
            "max_tokens": 128,
            "stream": true
        }))
        .unwrap();
        let body = build_request_body(&request);
        assert_eq!(
            body["prompt"],
            "Be terse.\n\nHuman: hi\n\nAssistant: hello\n\nHuman: bye\n\nAssistant:"
        );
        assert_eq!(body["max_tokens_to_sample"], 128);
        assert_eq!(body["model"], "claude-2");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_request_defaults_max_tokens() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "claude-2",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let body = build_request_body(&request);
        assert_eq!(body["max_tokens_to_sample"], 1_000_000);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(stop_reason_claude_to_openai("stop_sequence"), "stop");
        assert_eq!(stop_reason_claude_to_openai("max_tokens"), "length");
        assert_eq!(stop_reason_claude_to_openai("other"), "other");
    }

    #[test]
    fn test_stop_values_string_and_array() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "claude-2",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": "END"
        }))
        .unwrap();
        assert_eq!(build_request_body(&request)["stop_sequences"], json!(["END"]));

        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "claude-2",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(build_request_body(&request)["stop_sequences"], json!(["a", "b"]));
    }
}
