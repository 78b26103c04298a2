use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, StatusCode},
    response::Response,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::error;
use url::Url;
use uuid::Uuid;

use crate::relay::settle::Settlement;
use crate::relay::types::{
    GeneralRequest, Message, RelayError, StreamResponse, TextResponse, TextResponseChoice, Usage,
};
use crate::utils::sse::SseEvent;

const DEFAULT_HOST_URL: &str = "wss://spark-api.xf-yun.com/v1.1/chat";

pub struct XunfeiCredential {
    pub app_id: String,
    pub api_secret: String,
    pub api_key: String,
}

pub fn parse_credential(credential: &str) -> Result<XunfeiCredential, RelayError> {
    let parts: Vec<&str> = credential.split('|').collect();
    if parts.len() != 3 {
        return Err(RelayError::wrap(
            "channel credential must be appId|apiSecret|apiKey",
            "invalid_xunfei_config",
            StatusCode::INTERNAL_SERVER_ERROR,
        ));
    }
    Ok(XunfeiCredential {
        app_id: parts[0].to_string(),
        api_secret: parts[1].to_string(),
        api_key: parts[2].to_string(),
    })
}

/// Spark authenticates the websocket dial itself: an HMAC-SHA256 signature
/// over host, date, and request line, base64-wrapped into an authorization
/// query parameter.
pub fn build_auth_url(
    host_url: &str,
    api_key: &str,
    api_secret: &str,
    date: &str,
) -> Result<String, RelayError> {
    let parsed = Url::parse(host_url).map_err(|_| {
        RelayError::wrap(
            "invalid websocket host url",
            "invalid_xunfei_config",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    let host = parsed.host_str().unwrap_or_default().to_string();
    let path = parsed.path().to_string();

    let sign_string = format!("host: {}\ndate: {}\nGET {} HTTP/1.1", host, date, path);
    let mut mac = Hmac::<Sha256>::new_from_slice(api_secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(sign_string.as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        r#"api_key="{}", algorithm="hmac-sha256", headers="host date request-line", signature="{}""#,
        api_key, signature
    );
    let authorization = BASE64_STANDARD.encode(authorization_origin);

    let mut call_url = parsed;
    call_url
        .query_pairs_mut()
        .append_pair("host", &host)
        .append_pair("date", date)
        .append_pair("authorization", &authorization);
    Ok(call_url.to_string())
}

fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn build_chat_request(request: &GeneralRequest, app_id: &str) -> Value {
    let text: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            // Spark knows only user/assistant speakers.
            let role = if message.role == "system" { "user" } else { &message.role };
            json!({ "role": role, "content": message.content })
        })
        .collect();
    json!({
        "header": { "app_id": app_id },
        "parameter": {
            "chat": {
                "domain": "general",
                "temperature": request.temperature,
                "max_tokens": if request.max_tokens == 0 { Value::Null } else { Value::from(request.max_tokens) },
            }
        },
        "payload": { "message": { "text": text } },
    })
}

#[derive(Debug, Deserialize, Default)]
struct SparkHeader {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: i64,
}

#[derive(Debug, Deserialize, Default)]
struct SparkTextPiece {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct SparkChoices {
    #[serde(default)]
    text: Vec<SparkTextPiece>,
}

#[derive(Debug, Deserialize, Default)]
struct SparkUsageText {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[derive(Debug, Deserialize, Default)]
struct SparkUsage {
    #[serde(default)]
    text: SparkUsageText,
}

#[derive(Debug, Deserialize, Default)]
struct SparkPayload {
    #[serde(default)]
    choices: SparkChoices,
    #[serde(default)]
    usage: Option<SparkUsage>,
}

#[derive(Debug, Deserialize, Default)]
struct SparkResponse {
    #[serde(default)]
    header: SparkHeader,
    #[serde(default)]
    payload: SparkPayload,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the signed websocket endpoint and sends the chat request; this
/// adapter never touches the shared HTTP dispatcher.
async fn open_conversation(
    request: &GeneralRequest,
    credential: &XunfeiCredential,
    base_url: &str,
) -> Result<WsStream, RelayError> {
    let host_url = if base_url.is_empty() { DEFAULT_HOST_URL } else { base_url };
    let auth_url = build_auth_url(host_url, &credential.api_key, &credential.api_secret, &rfc1123_now())?;
    let (mut ws, _) = connect_async(auth_url.as_str()).await.map_err(|e| {
        RelayError::wrap(
            format!("websocket dial failed: {}", e),
            "do_request_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;

    let chat_request = build_chat_request(request, &credential.app_id);
    ws.send(tungstenite::Message::Text(chat_request.to_string().into()))
        .await
        .map_err(|e| {
            RelayError::wrap(
                format!("websocket send failed: {}", e),
                "do_request_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?;
    Ok(ws)
}

fn parse_frame(message: tungstenite::Message) -> Option<SparkResponse> {
    match message {
        tungstenite::Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
        _ => None,
    }
}

fn usage_from_spark(usage: &SparkUsageText, prompt_estimate: i64) -> Usage {
    if usage.total_tokens != 0 {
        Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    } else {
        Usage::new(prompt_estimate, 0)
    }
}

pub async fn stream_handler(
    request: &GeneralRequest,
    credential: &str,
    base_url: &str,
    prompt_tokens: i64,
    settlement: Settlement,
) -> Result<Response<Body>, RelayError> {
    let credential = parse_credential(credential)?;
    let mut ws = open_conversation(request, &credential, base_url).await?;

    let model = request.model.clone();
    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = Utc::now().timestamp();

    let stream = async_stream::stream! {
        let settlement = settlement;
        let mut usage = Usage::new(prompt_tokens, 0);

        while let Some(frame) = ws.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    error!("websocket read error: {}", e);
                    let envelope = RelayError::wrap(
                        format!("websocket read error: {}", e),
                        "stream_read_failed",
                        StatusCode::BAD_GATEWAY,
                    );
                    yield Ok::<_, std::io::Error>(SseEvent::data(envelope.envelope().to_string()).to_bytes());
                    break;
                }
            };
            let Some(spark_response) = parse_frame(frame) else { continue };
            if spark_response.header.code != 0 {
                error!(
                    "spark error {}: {}",
                    spark_response.header.code, spark_response.header.message
                );
                let envelope = RelayError::wrap(
                    spark_response.header.message.clone(),
                    "upstream_error",
                    StatusCode::BAD_GATEWAY,
                );
                yield Ok(SseEvent::data(envelope.envelope().to_string()).to_bytes());
                break;
            }

            for piece in &spark_response.payload.choices.text {
                let frame = StreamResponse::content_chunk(&id, &model, created, piece.content.clone());
                if let Ok(data) = serde_json::to_string(&frame) {
                    yield Ok(SseEvent::data(data).to_bytes());
                }
            }
            if let Some(spark_usage) = &spark_response.payload.usage {
                usage = usage_from_spark(&spark_usage.text, prompt_tokens);
            }
            if spark_response.header.status == 2 {
                if let Ok(data) = serde_json::to_string(&StreamResponse::stop_chunk(&id, &model, created)) {
                    yield Ok(SseEvent::data(data).to_bytes());
                }
                break;
            }
        }

        yield Ok(SseEvent::data("[DONE]").to_bytes());
        settlement.complete(usage);
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(stream))
        .unwrap())
}

pub async fn handler(
    request: &GeneralRequest,
    credential: &str,
    base_url: &str,
    prompt_tokens: i64,
    settlement: Settlement,
) -> Result<Response<Body>, RelayError> {
    let credential = parse_credential(credential)?;
    let mut ws = open_conversation(request, &credential, base_url).await?;

    let mut content = String::new();
    let mut usage = Usage::new(prompt_tokens, 0);
    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| {
            RelayError::wrap(
                format!("websocket read error: {}", e),
                "do_request_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?;
        let Some(spark_response) = parse_frame(frame) else { continue };
        if spark_response.header.code != 0 {
            drop(settlement);
            return Err(RelayError::wrap(
                spark_response.header.message,
                "upstream_error",
                StatusCode::BAD_GATEWAY,
            ));
        }
        for piece in &spark_response.payload.choices.text {
            content.push_str(&piece.content);
        }
        if let Some(spark_usage) = &spark_response.payload.usage {
            usage = usage_from_spark(&spark_usage.text, prompt_tokens);
        }
        if spark_response.header.status == 2 {
            break;
        }
    }

    let text_response = TextResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: String::new(),
        choices: vec![TextResponseChoice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content,
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_credential() {
        let credential = parse_credential("app1|secret1|key1").unwrap();
        assert_eq!(credential.app_id, "app1");
        assert_eq!(credential.api_secret, "secret1");
        assert_eq!(credential.api_key, "key1");
        assert!(parse_credential("app1|secret1").is_err());
    }

    #[test]
    fn test_auth_url_is_signed_and_deterministic() {
        let date = "Mon, 01 Jan 2024 00:00:00 GMT";
        let a = build_auth_url(DEFAULT_HOST_URL, "key", "secret", date).unwrap();
        let b = build_auth_url(DEFAULT_HOST_URL, "key", "secret", date).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("host=spark-api.xf-yun.com"));
        assert!(a.contains("authorization="));
        assert_ne!(a, build_auth_url(DEFAULT_HOST_URL, "key", "other", date).unwrap());
    }

    #[test]
    fn test_chat_request_shape() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "SparkDesk",
            "messages": [
                {"role": "system", "content": "brief"},
                {"role": "user", "content": "hi"}
            ],
            "max_tokens": 64
        }))
        .unwrap();
        let body = build_chat_request(&request, "app9");
        assert_eq!(body["header"]["app_id"], "app9");
        assert_eq!(body["payload"]["message"]["text"][0]["role"], "user");
        assert_eq!(body["parameter"]["chat"]["max_tokens"], 64);
    }

    #[test]
    fn test_usage_falls_back_to_prompt_estimate() {
        let usage = usage_from_spark(&SparkUsageText::default(), 7);
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.total_tokens, 7);
        let usage = usage_from_spark(
            &SparkUsageText { prompt_tokens: 3, completion_tokens: 4, total_tokens: 7 },
            99,
        );
        assert_eq!(usage.completion_tokens, 4);
    }
}
