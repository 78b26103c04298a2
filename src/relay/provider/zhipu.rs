use std::collections::HashMap;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, StatusCode},
    response::Response,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Mutex;
use tracing::error;

use crate::relay::settle::Settlement;
use crate::relay::types::{
    GeneralRequest, Message, OpenAiError, RelayError, StreamResponse, TextResponse,
    TextResponseChoice, Usage,
};
use crate::utils::sse::SseEvent;

const TOKEN_TTL_SECS: i64 = 180;

pub fn full_url(base_url: &str, model: &str, stream: bool) -> String {
    let method = if stream { "sse-invoke" } else { "invoke" };
    format!("{}/api/paas/v3/model-api/{}/{}", base_url, model, method)
}

static TOKEN_CACHE: Lazy<Mutex<HashMap<String, (String, i64)>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Authorization is a short-lived JWT derived from the `id.secret`
/// credential. The header carries the non-standard `sign_type` field the
/// upstream checks, so the token is assembled by hand.
pub fn get_zhipu_token(credential: &str) -> Result<String, RelayError> {
    let now = Utc::now().timestamp();
    {
        let cache = TOKEN_CACHE.lock().unwrap();
        if let Some((token, expires_at)) = cache.get(credential) {
            if *expires_at > now {
                return Ok(token.clone());
            }
        }
    }

    let (key_id, secret) = credential.split_once('.').ok_or_else(|| {
        RelayError::wrap(
            "channel credential must be id.secret",
            "invalid_zhipu_config",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;

    let header = json!({ "alg": "HS256", "sign_type": "SIGN" });
    let claims = json!({
        "api_key": key_id,
        "exp": (now + TOKEN_TTL_SECS) * 1000,
        "timestamp": now * 1000,
    });
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| {
        RelayError::wrap(
            "invalid signing secret",
            "invalid_zhipu_config",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    mac.update(signing_input.as_bytes());
    let token = format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    );

    TOKEN_CACHE.lock().unwrap().insert(
        credential.to_string(),
        (token.clone(), now + TOKEN_TTL_SECS - 60),
    );
    Ok(token)
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ZhipuMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ZhipuRequest {
    prompt: Vec<ZhipuMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    incremental: bool,
}

/// Same alternation trick as ERNIE: a system prompt becomes a user turn with
/// a synthetic acknowledgment.
pub fn build_request_body(request: &GeneralRequest) -> Value {
    let mut prompt = Vec::new();
    for message in &request.messages {
        if message.role == "system" {
            prompt.push(ZhipuMessage {
                role: "user".to_string(),
                content: message.content.clone(),
            });
            prompt.push(ZhipuMessage {
                role: "assistant".to_string(),
                content: "Okay".to_string(),
            });
        } else {
            prompt.push(ZhipuMessage {
                role: message.role.clone(),
                content: message.content.clone(),
            });
        }
    }
    let zhipu_request = ZhipuRequest {
        prompt,
        temperature: request.temperature,
        top_p: request.top_p,
        incremental: false,
    };
    serde_json::to_value(zhipu_request).unwrap_or(Value::Null)
}

#[derive(Debug, Deserialize, Default)]
struct ZhipuResponseData {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    choices: Vec<ZhipuMessage>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize, Default)]
struct ZhipuResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: ZhipuResponseData,
}

#[derive(Debug, Deserialize, Default)]
struct ZhipuStreamMeta {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    usage: Usage,
}

/// The upstream only reports total_tokens; billing treats it all as prompt.
fn fallback_usage(total_tokens: i64) -> Usage {
    Usage {
        prompt_tokens: total_tokens,
        completion_tokens: 0,
        total_tokens,
    }
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
    let zhipu_response: ZhipuResponse = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if !zhipu_response.success {
        drop(settlement);
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: zhipu_response.msg,
                error_type: "upstream_error".to_string(),
                param: String::new(),
                code: Value::from(zhipu_response.code),
            },
        ));
    }

    let usage = fallback_usage(zhipu_response.data.usage.total_tokens);
    let choices = zhipu_response
        .data
        .choices
        .into_iter()
        .enumerate()
        .map(|(index, choice)| TextResponseChoice {
            index: index as i64,
            message: Message {
                role: choice.role,
                // Content arrives as a JSON-quoted string.
                content: choice.content.trim_matches('"').to_string(),
                name: None,
            },
            finish_reason: "stop".to_string(),
        })
        .collect();
    let text_response = TextResponse {
        id: zhipu_response.data.task_id,
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

/// The sse-invoke wire format is line-oriented: `data:` lines carry content
/// pieces and the closing `meta:` line carries usage, so this handler works
/// on raw lines rather than the shared SSE parser.
pub fn stream_handler(
    response: reqwest::Response,
    model: &str,
    settlement: Settlement,
) -> Response<Body> {
    let model = model.to_string();
    let created = Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut usage = Usage::default();
        let mut stream_id = String::new();
        let settlement = settlement;

        'outer: while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!("upstream stream error: {}", e);
                    let envelope = RelayError::wrap(
                        format!("upstream stream error: {}", e),
                        "stream_read_failed",
                        StatusCode::BAD_GATEWAY,
                    );
                    yield Ok::<_, std::io::Error>(SseEvent::data(envelope.envelope().to_string()).to_bytes());
                    break 'outer;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let line = String::from_utf8_lossy(&line).into_owned();

                if let Some(content) = line.strip_prefix("data:") {
                    let frame = StreamResponse::content_chunk(
                        &stream_id,
                        &model,
                        created,
                        content.to_string(),
                    );
                    if let Ok(data) = serde_json::to_string(&frame) {
                        yield Ok(SseEvent::data(data).to_bytes());
                    }
                } else if let Some(meta) = line.strip_prefix("meta:") {
                    if let Ok(meta) = serde_json::from_str::<ZhipuStreamMeta>(meta) {
                        usage = fallback_usage(meta.usage.total_tokens);
                        stream_id = meta.task_id;
                    }
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
    fn test_full_url_stream_suffix() {
        assert_eq!(
            full_url("https://open.bigmodel.cn", "chatglm_pro", false),
            "https://open.bigmodel.cn/api/paas/v3/model-api/chatglm_pro/invoke"
        );
        assert_eq!(
            full_url("https://open.bigmodel.cn", "chatglm_pro", true),
            "https://open.bigmodel.cn/api/paas/v3/model-api/chatglm_pro/sse-invoke"
        );
    }

    #[test]
    fn test_token_has_three_segments_and_caches() {
        let token = get_zhipu_token("my-id.my-secret").unwrap();
        assert_eq!(token.split('.').count(), 3);

        let header_b64 = token.split('.').next().unwrap();
        let header: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64).unwrap()).unwrap();
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["sign_type"], "SIGN");

        // Second call inside the TTL returns the cached token verbatim.
        assert_eq!(get_zhipu_token("my-id.my-secret").unwrap(), token);
    }

    #[test]
    fn test_token_rejects_malformed_credential() {
        assert!(get_zhipu_token("no-separator").is_err());
    }

    #[test]
    fn test_usage_fallback_bills_total_as_prompt() {
        let usage = fallback_usage(42);
        assert_eq!(usage.prompt_tokens, 42);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn test_request_body_system_alternation() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "chatglm_pro",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hi"}
            ]
        }))
        .unwrap();
        let body = build_request_body(&request);
        let prompt = body["prompt"].as_array().unwrap();
        assert_eq!(prompt.len(), 3);
        assert_eq!(prompt[1]["content"], "Okay");
        assert_eq!(body["incremental"], false);
    }
}
