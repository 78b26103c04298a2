use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, StatusCode},
    response::Response,
};
use chrono::Utc;
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
use crate::utils::sse::SseEvent;

pub fn full_url(base_url: &str, api_key: &str) -> String {
    format!(
        "{}/v1beta2/models/chat-bison-001:generateMessage?key={}",
        base_url, api_key
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct PalmChatMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct PalmPrompt {
    messages: Vec<PalmChatMessage>,
}

#[derive(Debug, Serialize)]
struct PalmChatRequest {
    prompt: PalmPrompt,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(rename = "candidateCount", skip_serializing_if = "Option::is_none")]
    candidate_count: Option<i64>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct PalmChatResponse {
    #[serde(default)]
    candidates: Vec<PalmChatMessage>,
    #[serde(default)]
    error: PalmError,
}

#[derive(Debug, Deserialize, Default)]
struct PalmError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

pub fn build_request_body(request: &GeneralRequest) -> Value {
    let palm_request = PalmChatRequest {
        prompt: PalmPrompt {
            messages: request
                .messages
                .iter()
                .map(|m| PalmChatMessage {
                    content: m.content.clone(),
                })
                .collect(),
        },
        temperature: request.temperature,
        candidate_count: request.n,
        top_p: request.top_p,
    };
    serde_json::to_value(palm_request).unwrap_or(Value::Null)
}

fn parse_response(body: &[u8]) -> Result<PalmChatResponse, RelayError> {
    let palm_response: PalmChatResponse = serde_json::from_slice(body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if !palm_response.error.message.is_empty() {
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: palm_response.error.message,
                error_type: palm_response.error.status,
                param: String::new(),
                code: Value::from(palm_response.error.code),
            },
        ));
    }
    Ok(palm_response)
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
    let palm_response = match parse_response(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            drop(settlement);
            return Err(e);
        }
    };

    let choices: Vec<TextResponseChoice> = palm_response
        .candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| TextResponseChoice {
            index: index as i64,
            message: Message {
                role: "assistant".to_string(),
                content: candidate.content.clone(),
                name: None,
            },
            finish_reason: "stop".to_string(),
        })
        .collect();
    let completion_text: String = palm_response
        .candidates
        .iter()
        .map(|c| c.content.as_str())
        .collect();
    let usage = Usage::new(prompt_tokens, token_count::count_text(&completion_text, model));

    let text_response = TextResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
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

/// The PaLM2 API has no streaming variant; the whole response is read and
/// re-framed as a single canonical chunk so streaming callers still work.
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
        let settlement = settlement;
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                error!("failed to read upstream response body: {}", e);
                let envelope = RelayError::wrap(
                    format!("failed to read upstream response body: {}", e),
                    "read_response_body_failed",
                    StatusCode::BAD_GATEWAY,
                );
                yield Ok::<_, std::io::Error>(SseEvent::data(envelope.envelope().to_string()).to_bytes());
                return;
            }
        };
        let palm_response = match parse_response(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                yield Ok(SseEvent::data(e.envelope().to_string()).to_bytes());
                return;
            }
        };
        let content: String = palm_response
            .candidates
            .iter()
            .map(|c| c.content.as_str())
            .collect();

        let frame = StreamResponse::content_chunk(&id, &model, created, content.clone());
        if let Ok(data) = serde_json::to_string(&frame) {
            yield Ok(SseEvent::data(data).to_bytes());
        }
        if let Ok(data) = serde_json::to_string(&StreamResponse::stop_chunk(&id, &model, created)) {
            yield Ok(SseEvent::data(data).to_bytes());
        }
        yield Ok(SseEvent::data("[DONE]").to_bytes());

        settlement.complete(Usage::new(prompt_tokens, token_count::count_text(&content, &model)));
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
    fn test_full_url_carries_key() {
        assert_eq!(
            full_url("https://generativelanguage.googleapis.com", "k123"),
            "https://generativelanguage.googleapis.com/v1beta2/models/chat-bison-001:generateMessage?key=k123"
        );
    }

    #[test]
    fn test_request_body_shape() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "PaLM-2",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.7,
            "n": 2
        }))
        .unwrap();
        let body = build_request_body(&request);
        assert_eq!(body["prompt"]["messages"][0]["content"], "hi");
        assert_eq!(body["candidateCount"], 2);
        assert_eq!(body["temperature"], 0.7);
    }

    #[test]
    fn test_error_response_surfaces_envelope() {
        let body = json!({"error": {"code": 400, "message": "bad key", "status": "INVALID_ARGUMENT"}});
        let err = parse_response(body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.error.message, "bad key");
        assert_eq!(err.error.error_type, "INVALID_ARGUMENT");
    }
}
