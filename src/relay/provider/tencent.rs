use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, StatusCode},
    response::Response,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::Sha1;
use tracing::error;
use uuid::Uuid;

use crate::relay::settle::Settlement;
use crate::relay::types::{
    GeneralRequest, Message, OpenAiError, RelayError, StreamResponse, TextResponse,
    TextResponseChoice, Usage,
};
use crate::utils::sse::{SseEvent, SseParser};

const SIGN_HOST: &str = "hunyuan.cloud.tencent.com";

pub fn full_url(base_url: &str) -> String {
    format!("{}/hyllm/v1/chat/completions", base_url)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
struct TencentMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct TencentChatRequest {
    app_id: i64,
    secret_id: String,
    timestamp: i64,
    expired: i64,
    query_id: String,
    temperature: f64,
    top_p: f64,
    stream: i64,
    messages: Vec<TencentMessage>,
}

pub struct TencentCredential {
    pub app_id: i64,
    pub secret_id: String,
    pub secret_key: String,
}

pub fn parse_credential(credential: &str) -> Result<TencentCredential, RelayError> {
    let parts: Vec<&str> = credential.split('|').collect();
    if parts.len() != 3 {
        return Err(RelayError::wrap(
            "channel credential must be appId|secretId|secretKey",
            "invalid_tencent_config",
            StatusCode::INTERNAL_SERVER_ERROR,
        ));
    }
    let app_id = parts[0].parse::<i64>().map_err(|_| {
        RelayError::wrap(
            "appId must be numeric",
            "invalid_tencent_config",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    Ok(TencentCredential {
        app_id,
        secret_id: parts[1].to_string(),
        secret_key: parts[2].to_string(),
    })
}

fn convert_messages(request: &GeneralRequest) -> Vec<TencentMessage> {
    let mut messages = Vec::new();
    for message in &request.messages {
        if message.role == "system" {
            messages.push(TencentMessage {
                role: "user".to_string(),
                content: message.content.clone(),
            });
            messages.push(TencentMessage {
                role: "assistant".to_string(),
                content: "Okay".to_string(),
            });
        } else {
            messages.push(TencentMessage {
                role: message.role.clone(),
                content: message.content.clone(),
            });
        }
    }
    messages
}

/// The hunyuan signature covers the sorted query-style rendering of the
/// whole request, HMAC-SHA1 over the host-prefixed URL, base64 encoded.
fn compute_sign(request: &TencentChatRequest, secret_key: &str) -> String {
    let mut params = vec![
        format!("app_id={}", request.app_id),
        format!("secret_id={}", request.secret_id),
        format!("timestamp={}", request.timestamp),
        format!("query_id={}", request.query_id),
        format!("temperature={}", request.temperature),
        format!("top_p={}", request.top_p),
        format!("stream={}", request.stream),
        format!("expired={}", request.expired),
    ];
    let message_str = request
        .messages
        .iter()
        .map(|m| format!(r#"{{"role":"{}","content":"{}"}}"#, m.role, m.content))
        .collect::<Vec<_>>()
        .join(",");
    params.push(format!("messages=[{}]", message_str));
    params.sort();

    let sign_url = format!("{}/hyllm/v1/chat/completions?{}", SIGN_HOST, params.join("&"));
    let mut mac = Hmac::<Sha1>::new_from_slice(secret_key.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(sign_url.as_bytes());
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}

/// Builds the signed body; the returned signature goes into the outbound
/// Authorization header as-is.
pub fn build_signed_request(
    request: &GeneralRequest,
    credential: &str,
) -> Result<(Value, String), RelayError> {
    let credential = parse_credential(credential)?;
    let now = Utc::now().timestamp();
    let tencent_request = TencentChatRequest {
        app_id: credential.app_id,
        secret_id: credential.secret_id,
        timestamp: now,
        expired: now + 24 * 60 * 60,
        query_id: Uuid::new_v4().to_string(),
        temperature: request.temperature.unwrap_or(0.0),
        top_p: request.top_p.unwrap_or(0.0),
        stream: if request.stream { 1 } else { 0 },
        messages: convert_messages(request),
    };
    let sign = compute_sign(&tencent_request, &credential.secret_key);
    let body = serde_json::to_value(&tencent_request).map_err(|e| {
        RelayError::wrap(
            format!("failed to serialize request: {}", e),
            "marshal_text_request_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    Ok((body, sign))
}

#[derive(Debug, Deserialize, Default)]
struct TencentChoice {
    #[serde(default)]
    finish_reason: String,
    #[serde(default)]
    messages: Option<TencentMessage>,
    #[serde(default)]
    delta: Option<TencentMessage>,
}

#[derive(Debug, Deserialize, Default)]
struct TencentError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize, Default)]
struct TencentChatResponse {
    #[serde(default)]
    choices: Vec<TencentChoice>,
    #[serde(default)]
    id: String,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    error: TencentError,
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
    let tencent_response: TencentChatResponse = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if tencent_response.error.code != 0 {
        drop(settlement);
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: tencent_response.error.message,
                error_type: "upstream_error".to_string(),
                param: String::new(),
                code: Value::from(tencent_response.error.code),
            },
        ));
    }

    let usage = tencent_response.usage;
    let choices = tencent_response
        .choices
        .into_iter()
        .enumerate()
        .map(|(index, choice)| TextResponseChoice {
            index: index as i64,
            message: Message {
                role: "assistant".to_string(),
                content: choice.messages.map(|m| m.content).unwrap_or_default(),
                name: None,
            },
            finish_reason: choice.finish_reason,
        })
        .collect();
    let text_response = TextResponse {
        id: tencent_response.id,
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: String::new(),
        choices,
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

/// Hunyuan reports no usage on the stream; completion text is counted here
/// and settled against the pipeline's prompt estimate.
pub fn stream_handler(
    response: reqwest::Response,
    model: &str,
    prompt_tokens: i64,
    settlement: Settlement,
) -> Response<Body> {
    let model = model.to_string();
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
                        let Ok(tencent_response) = serde_json::from_str::<TencentChatResponse>(&event.data) else {
                            continue;
                        };
                        for choice in &tencent_response.choices {
                            let Some(delta) = &choice.delta else { continue };
                            response_text.push_str(&delta.content);
                            let frame = StreamResponse::content_chunk(
                                &tencent_response.id,
                                &model,
                                created,
                                delta.content.clone(),
                            );
                            if let Ok(data) = serde_json::to_string(&frame) {
                                yield Ok::<_, std::io::Error>(SseEvent::data(data).to_bytes());
                            }
                            if choice.finish_reason == "stop" {
                                if let Ok(data) = serde_json::to_string(&StreamResponse::stop_chunk(
                                    &tencent_response.id,
                                    &model,
                                    created,
                                )) {
                                    yield Ok(SseEvent::data(data).to_bytes());
                                }
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
        let completion_tokens = crate::relay::token_count::count_text(&response_text, &model);
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
    fn test_parse_credential() {
        let credential = parse_credential("1251234567|AKIDxxxx|secretvalue").unwrap();
        assert_eq!(credential.app_id, 1251234567);
        assert_eq!(credential.secret_id, "AKIDxxxx");
        assert_eq!(credential.secret_key, "secretvalue");

        assert!(parse_credential("only|two").is_err());
        assert!(parse_credential("abc|id|key").is_err());
    }

    #[test]
    fn test_signed_request_carries_identity() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "ChatPro",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .unwrap();
        let (body, sign) = build_signed_request(&request, "123|sid|skey").unwrap();
        assert_eq!(body["app_id"], 123);
        assert_eq!(body["secret_id"], "sid");
        assert_eq!(body["stream"], 1);
        assert!(!sign.is_empty());
        // The signature is base64; decoding must succeed.
        assert!(BASE64_STANDARD.decode(&sign).is_ok());
    }

    #[test]
    fn test_sign_is_deterministic_for_fixed_request() {
        let request = TencentChatRequest {
            app_id: 1,
            secret_id: "sid".to_string(),
            timestamp: 1700000000,
            expired: 1700086400,
            query_id: "q".to_string(),
            temperature: 0.0,
            top_p: 0.0,
            stream: 0,
            messages: vec![TencentMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
        };
        let a = compute_sign(&request, "skey");
        let b = compute_sign(&request, "skey");
        assert_eq!(a, b);
        assert_ne!(a, compute_sign(&request, "other"));
    }
}
