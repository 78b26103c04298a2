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

use crate::relay::settle::Settlement;
use crate::relay::types::{
    EmbeddingData, EmbeddingResponse, GeneralRequest, Message, OpenAiError, RelayError,
    RelayMode, StreamResponse, TextResponse, TextResponseChoice, Usage,
};
use crate::utils::sse::{SseEvent, SseParser};

pub fn full_url(base_url: &str, relay_mode: RelayMode) -> String {
    match relay_mode {
        RelayMode::Embeddings => format!(
            "{}/api/v1/services/embeddings/text-embedding/text-embedding",
            base_url
        ),
        _ => format!(
            "{}/api/v1/services/aigc/text-generation/generation",
            base_url
        ),
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct AliHistoryTurn {
    user: String,
    bot: String,
}

#[derive(Debug, Serialize)]
struct AliInput {
    prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    history: Vec<AliHistoryTurn>,
}

#[derive(Debug, Serialize)]
struct AliChatRequest {
    model: String,
    input: AliInput,
}

/// DashScope wants the current prompt separated from prior turns; history is
/// a list of (user, bot) pairs. System prompts and unpaired user turns get a
/// synthetic acknowledgment.
pub fn build_request_body(request: &GeneralRequest) -> Value {
    let mut history = Vec::new();
    let mut prompt = String::new();
    let messages = &request.messages;

    let mut i = 0;
    while i < messages.len() {
        let message = &messages[i];
        if message.role == "system" {
            history.push(AliHistoryTurn {
                user: message.content.clone(),
                bot: "Okay".to_string(),
            });
            i += 1;
            continue;
        }
        if i == messages.len() - 1 {
            prompt = message.content.clone();
            break;
        }
        if message.role == "user" && messages[i + 1].role == "assistant" {
            history.push(AliHistoryTurn {
                user: message.content.clone(),
                bot: messages[i + 1].content.clone(),
            });
            i += 2;
            continue;
        }
        history.push(AliHistoryTurn {
            user: message.content.clone(),
            bot: "Okay".to_string(),
        });
        i += 1;
    }

    let ali_request = AliChatRequest {
        model: request.model.clone(),
        input: AliInput { prompt, history },
    };
    serde_json::to_value(ali_request).unwrap_or(Value::Null)
}

pub fn build_embedding_request_body(request: &GeneralRequest) -> Value {
    let texts = match &request.input {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    serde_json::json!({
        "model": request.model,
        "input": { "texts": texts },
    })
}

pub fn build_body_for_mode(request: &GeneralRequest, relay_mode: RelayMode) -> Value {
    match relay_mode {
        RelayMode::Embeddings => build_embedding_request_body(request),
        _ => build_request_body(request),
    }
}

#[derive(Debug, Deserialize, Default)]
struct AliOutput {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Debug, Deserialize, Default)]
struct AliUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[derive(Debug, Deserialize, Default)]
struct AliResponse {
    #[serde(default)]
    output: AliOutput,
    #[serde(default)]
    usage: AliUsage,
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn check_ali_error(response: &AliResponse) -> Result<(), RelayError> {
    if !response.code.is_empty() {
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: response.message.clone(),
                error_type: response.code.clone(),
                param: response.request_id.clone(),
                code: Value::String(response.code.clone()),
            },
        ));
    }
    Ok(())
}

fn usage_from_ali(usage: &AliUsage) -> Usage {
    Usage::new(usage.input_tokens, usage.output_tokens)
}

pub async fn handler(
    response: reqwest::Response,
    settlement: Settlement,
) -> Result<Response<Body>, RelayError> {
    let body = response.bytes().await.map_err(|e| {
        RelayError::wrap(
            format!("failed to read upstream response body: {}", e),
            "read_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    let ali_response: AliResponse = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if let Err(e) = check_ali_error(&ali_response) {
        drop(settlement);
        return Err(e);
    }

    let usage = usage_from_ali(&ali_response.usage);
    let text_response = TextResponse {
        id: ali_response.request_id,
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: String::new(),
        choices: vec![TextResponseChoice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content: ali_response.output.text,
                name: None,
            },
            finish_reason: if ali_response.output.finish_reason.is_empty() {
                "stop".to_string()
            } else {
                ali_response.output.finish_reason
            },
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

#[derive(Debug, Deserialize, Default)]
struct AliEmbeddingOutput {
    #[serde(default)]
    embeddings: Vec<AliEmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct AliEmbeddingItem {
    #[serde(default)]
    text_index: i64,
    #[serde(default)]
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct AliEmbeddingResponse {
    #[serde(default)]
    output: AliEmbeddingOutput,
    #[serde(default)]
    usage: AliUsage,
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

pub async fn embedding_handler(
    response: reqwest::Response,
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
    let ali_response: AliEmbeddingResponse = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if !ali_response.code.is_empty() {
        drop(settlement);
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: ali_response.message,
                error_type: ali_response.code.clone(),
                param: ali_response.request_id,
                code: Value::String(ali_response.code),
            },
        ));
    }

    // The embedding endpoint only reports total_tokens.
    let usage = Usage {
        prompt_tokens: ali_response.usage.total_tokens,
        completion_tokens: 0,
        total_tokens: ali_response.usage.total_tokens,
    };
    let embedding_response = EmbeddingResponse {
        object: "list".to_string(),
        data: ali_response
            .output
            .embeddings
            .into_iter()
            .map(|item| EmbeddingData {
                object: "embedding".to_string(),
                index: item.text_index,
                embedding: item.embedding,
            })
            .collect(),
        model: model.to_string(),
        usage,
    };
    settlement.complete(usage);

    let body = serde_json::to_vec(&embedding_response).map_err(|e| {
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

/// DashScope streams the cumulative text on every event; the canonical
/// chunks carry only the suffix beyond what was already sent.
pub fn stream_handler(
    response: reqwest::Response,
    model: &str,
    settlement: Settlement,
) -> Response<Body> {
    let model = model.to_string();
    let created = Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut sent_text = String::new();
        let mut usage = Usage::default();
        let mut stream_id = String::new();
        let settlement = settlement;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in parser.process(&chunk) {
                        let Ok(ali_response) = serde_json::from_str::<AliResponse>(&event.data) else {
                            continue;
                        };
                        if ali_response.usage.input_tokens + ali_response.usage.output_tokens != 0 {
                            usage = usage_from_ali(&ali_response.usage);
                        }
                        if !ali_response.request_id.is_empty() {
                            stream_id = ali_response.request_id.clone();
                        }
                        let full_text = ali_response.output.text;
                        let delta = full_text
                            .strip_prefix(sent_text.as_str())
                            .unwrap_or(full_text.as_str())
                            .to_string();
                        sent_text = full_text;

                        let frame = StreamResponse::content_chunk(&stream_id, &model, created, delta);
                        if let Ok(data) = serde_json::to_string(&frame) {
                            yield Ok::<_, std::io::Error>(SseEvent::data(data).to_bytes());
                        }
                        if ali_response.output.finish_reason == "stop" {
                            if let Ok(data) = serde_json::to_string(&StreamResponse::stop_chunk(
                                &stream_id,
                                &model,
                                created,
                            )) {
                                yield Ok(SseEvent::data(data).to_bytes());
                            }
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

        yield Ok(SseEvent::data("[DONE]").to_bytes());
        settlement.complete(usage);
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
    fn test_urls_per_mode() {
        assert_eq!(
            full_url("https://dashscope.aliyuncs.com", RelayMode::ChatCompletions),
            "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation"
        );
        assert_eq!(
            full_url("https://dashscope.aliyuncs.com", RelayMode::Embeddings),
            "https://dashscope.aliyuncs.com/api/v1/services/embeddings/text-embedding/text-embedding"
        );
    }

    #[test]
    fn test_history_pairing() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "qwen-turbo",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "q1"},
                {"role": "assistant", "content": "a1"},
                {"role": "user", "content": "q2"}
            ]
        }))
        .unwrap();
        let body = build_request_body(&request);
        assert_eq!(body["input"]["prompt"], "q2");
        let history = body["input"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["user"], "Be brief.");
        assert_eq!(history[0]["bot"], "Okay");
        assert_eq!(history[1]["user"], "q1");
        assert_eq!(history[1]["bot"], "a1");
    }

    #[test]
    fn test_single_message_is_the_prompt() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "qwen-turbo",
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .unwrap();
        let body = build_request_body(&request);
        assert_eq!(body["input"]["prompt"], "hello");
        assert!(body["input"].get("history").is_none());
    }

    #[test]
    fn test_error_code_surfaces() {
        let response: AliResponse = serde_json::from_value(json!({
            "code": "InvalidApiKey",
            "message": "Invalid API-key provided.",
            "request_id": "r1"
        }))
        .unwrap();
        let err = check_ali_error(&response).unwrap_err();
        assert_eq!(err.error.error_type, "InvalidApiKey");
    }

    #[test]
    fn test_usage_mapping() {
        let usage = usage_from_ali(&AliUsage {
            input_tokens: 10,
            output_tokens: 4,
            total_tokens: 0,
        });
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 4);
        assert_eq!(usage.total_tokens, 14);
    }
}
