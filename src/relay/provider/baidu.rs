use std::collections::HashMap;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, StatusCode},
    response::Response,
};
use chrono::Utc;
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::error;

use crate::relay::settle::Settlement;
use crate::relay::types::{
    EmbeddingData, EmbeddingResponse, GeneralRequest, Message, OpenAiError, RelayError,
    RelayMode, StreamResponse, TextResponse, TextResponseChoice, Usage,
};
use crate::utils::sse::{SseEvent, SseParser};

/// Model name selects one of the fixed wenxinworkshop endpoints.
pub fn full_url(base_url: &str, model: &str, access_token: &str) -> Result<String, RelayError> {
    let path = match model {
        "ERNIE-Bot" => "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions",
        "ERNIE-Bot-turbo" => "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/eb-instant",
        "ERNIE-Bot-4" => "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions_pro",
        "BLOOMZ-7B" => "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/bloomz_7b1",
        "Embedding-V1" => "/rpc/2.0/ai_custom/v1/wenxinworkshop/embeddings/embedding-v1",
        other => {
            return Err(RelayError::wrap(
                format!("model {} is not supported by this channel", other),
                "unsupported_model",
                StatusCode::BAD_REQUEST,
            ))
        }
    };
    Ok(format!("{}{}?access_token={}", base_url, path, access_token))
}

#[derive(Debug, Deserialize)]
struct BaiduAccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    error_description: String,
}

static ACCESS_TOKENS: Lazy<Mutex<HashMap<String, (String, i64)>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Exchanges the `client_id|client_secret` channel credential for a cached
/// access token; the cache entry expires an hour before the token does.
pub async fn get_access_token(credential: &str) -> Result<String, RelayError> {
    {
        let cache = ACCESS_TOKENS.lock().await;
        if let Some((token, expires_at)) = cache.get(credential) {
            if *expires_at > Utc::now().timestamp() {
                return Ok(token.clone());
            }
        }
    }

    let (client_id, client_secret) = credential.split_once('|').ok_or_else(|| {
        RelayError::wrap(
            "channel credential must be client_id|client_secret",
            "invalid_baidu_config",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    let url = format!(
        "https://aip.baidubce.com/oauth/2.0/token?grant_type=client_credentials&client_id={}&client_secret={}",
        client_id, client_secret
    );
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .map_err(|e| {
            RelayError::wrap(
                format!("access token exchange failed: {}", e),
                "invalid_baidu_config",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?
        .json::<BaiduAccessTokenResponse>()
        .await
        .map_err(|e| {
            RelayError::wrap(
                format!("access token response unreadable: {}", e),
                "invalid_baidu_config",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?;
    if response.access_token.is_empty() {
        return Err(RelayError::wrap(
            format!("access token exchange rejected: {}", response.error_description),
            "invalid_baidu_config",
            StatusCode::INTERNAL_SERVER_ERROR,
        ));
    }

    let expires_at = Utc::now().timestamp() + response.expires_in - 3600;
    ACCESS_TOKENS.lock().await.insert(
        credential.to_string(),
        (response.access_token.clone(), expires_at),
    );
    Ok(response.access_token)
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct BaiduMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct BaiduChatRequest {
    messages: Vec<BaiduMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

/// ERNIE insists on a strict user/assistant alternation, so a system prompt
/// becomes a user turn acknowledged by a synthetic assistant turn.
pub fn build_request_body(request: &GeneralRequest) -> Value {
    let mut messages = Vec::new();
    for message in &request.messages {
        if message.role == "system" {
            messages.push(BaiduMessage {
                role: "user".to_string(),
                content: message.content.clone(),
            });
            messages.push(BaiduMessage {
                role: "assistant".to_string(),
                content: "Okay".to_string(),
            });
        } else {
            messages.push(BaiduMessage {
                role: message.role.clone(),
                content: message.content.clone(),
            });
        }
    }
    let baidu_request = BaiduChatRequest {
        messages,
        stream: request.stream,
        user_id: request.user.clone(),
    };
    serde_json::to_value(baidu_request).unwrap_or(Value::Null)
}

pub fn build_embedding_request_body(request: &GeneralRequest) -> Value {
    let input = match &request.input {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    serde_json::json!({ "input": input })
}

#[derive(Debug, Deserialize, Default)]
struct BaiduChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_end: bool,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

fn check_baidu_error(response: &BaiduChatResponse) -> Result<(), RelayError> {
    if response.error_code != 0 {
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: response.error_msg.clone(),
                error_type: "upstream_error".to_string(),
                param: String::new(),
                code: Value::from(response.error_code),
            },
        ));
    }
    Ok(())
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
    let baidu_response: BaiduChatResponse = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if let Err(e) = check_baidu_error(&baidu_response) {
        drop(settlement);
        return Err(e);
    }

    let usage = baidu_response.usage;
    let text_response = TextResponse {
        id: baidu_response.id,
        object: "chat.completion".to_string(),
        created: baidu_response.created,
        model: String::new(),
        choices: vec![TextResponseChoice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content: baidu_response.result,
                name: None,
            },
            finish_reason: "stop".to_string(),
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
struct BaiduEmbeddingResponse {
    #[serde(default)]
    data: Vec<BaiduEmbeddingData>,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct BaiduEmbeddingData {
    #[serde(default)]
    index: i64,
    #[serde(default)]
    embedding: Vec<f64>,
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
    let baidu_response: BaiduEmbeddingResponse = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if baidu_response.error_code != 0 {
        drop(settlement);
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: baidu_response.error_msg,
                error_type: "upstream_error".to_string(),
                param: String::new(),
                code: Value::from(baidu_response.error_code),
            },
        ));
    }
    let usage = baidu_response.usage;
    let embedding_response = EmbeddingResponse {
        object: "list".to_string(),
        data: baidu_response
            .data
            .into_iter()
            .map(|d| EmbeddingData {
                object: "embedding".to_string(),
                index: d.index,
                embedding: d.embedding,
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
        let mut usage = Usage::default();
        let settlement = settlement;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in parser.process(&chunk) {
                        let Ok(baidu_response) = serde_json::from_str::<BaiduChatResponse>(&event.data) else {
                            continue;
                        };
                        // ERNIE reports cumulative usage on every chunk.
                        if baidu_response.usage.total_tokens != 0 {
                            usage = baidu_response.usage;
                        }
                        let frame = StreamResponse::content_chunk(
                            &baidu_response.id,
                            &model,
                            created,
                            baidu_response.result,
                        );
                        if let Ok(data) = serde_json::to_string(&frame) {
                            yield Ok::<_, std::io::Error>(SseEvent::data(data).to_bytes());
                        }
                        if baidu_response.is_end {
                            if let Ok(data) = serde_json::to_string(&StreamResponse::stop_chunk(
                                &baidu_response.id,
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

/// Routes baidu bodies by relay mode; the embedding endpoint has its own
/// request shape.
pub fn build_body_for_mode(request: &GeneralRequest, relay_mode: RelayMode) -> Value {
    match relay_mode {
        RelayMode::Embeddings => build_embedding_request_body(request),
        _ => build_request_body(request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_url_per_model() {
        let url = full_url("https://aip.baidubce.com", "ERNIE-Bot", "tok").unwrap();
        assert_eq!(
            url,
            "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions?access_token=tok"
        );
        let url = full_url("https://aip.baidubce.com", "Embedding-V1", "tok").unwrap();
        assert!(url.contains("/embeddings/embedding-v1"));
        assert!(full_url("https://aip.baidubce.com", "gpt-4", "tok").is_err());
    }

    #[test]
    fn test_system_message_becomes_acknowledged_turn() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "ERNIE-Bot",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hi"}
            ]
        }))
        .unwrap();
        let body = build_request_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Be brief.");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "Okay");
        assert_eq!(messages[2]["role"], "user");
    }

    #[test]
    fn test_embedding_request_accepts_string_and_array() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "Embedding-V1",
            "input": "hello"
        }))
        .unwrap();
        assert_eq!(build_embedding_request_body(&request), json!({"input": ["hello"]}));

        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "Embedding-V1",
            "input": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(build_embedding_request_body(&request), json!({"input": ["a", "b"]}));
    }

    #[test]
    fn test_error_code_surfaces() {
        let response: BaiduChatResponse =
            serde_json::from_value(json!({"error_code": 110, "error_msg": "token expired"})).unwrap();
        let err = check_baidu_error(&response).unwrap_err();
        assert_eq!(err.error.message, "token expired");
        assert_eq!(err.error.code, json!(110));
    }
}
