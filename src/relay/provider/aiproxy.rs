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
    format!("{}/api/library/ask", base_url)
}

#[derive(Debug, Serialize)]
struct LibraryRequest {
    model: String,
    query: String,
    #[serde(rename = "libraryId")]
    library_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

/// The library endpoint answers a single question; the last message is the
/// query and the library id comes from the channel context.
pub fn build_request_body(request: &GeneralRequest, library_id: &str) -> Value {
    let query = request
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let library_request = LibraryRequest {
        model: request.model.clone(),
        query,
        library_id: library_id.to_string(),
        stream: request.stream,
    };
    serde_json::to_value(library_request).unwrap_or(Value::Null)
}

#[derive(Debug, Deserialize, Default)]
struct LibraryDocument {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize, Default)]
struct LibraryResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    documents: Vec<LibraryDocument>,
    #[serde(default)]
    message: String,
    #[serde(default, rename = "errCode")]
    err_code: i64,
}

#[derive(Debug, Deserialize, Default)]
struct LibraryStreamChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    documents: Vec<LibraryDocument>,
    #[serde(default)]
    finish: bool,
}

fn documents_to_markdown(documents: &[LibraryDocument]) -> String {
    if documents.is_empty() {
        return String::new();
    }
    let mut text = String::from("\n\nReferences:\n");
    for (index, document) in documents.iter().enumerate() {
        text.push_str(&format!("{}. [{}]({})\n", index + 1, document.title, document.url));
    }
    text
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
    let library_response: LibraryResponse = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse upstream response: {}", e),
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if !library_response.success && library_response.err_code != 0 {
        drop(settlement);
        return Err(RelayError::from_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            OpenAiError {
                message: library_response.message,
                error_type: "upstream_error".to_string(),
                param: String::new(),
                code: Value::from(library_response.err_code),
            },
        ));
    }

    let content = format!(
        "{}{}",
        library_response.answer,
        documents_to_markdown(&library_response.documents)
    );
    let usage = Usage::new(prompt_tokens, token_count::count_text(&content, model));
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
                        let Ok(library_chunk) = serde_json::from_str::<LibraryStreamChunk>(&event.data) else {
                            continue;
                        };
                        // Reference list arrives on its own closing event.
                        let piece = if library_chunk.documents.is_empty() {
                            library_chunk.content
                        } else {
                            documents_to_markdown(&library_chunk.documents)
                        };
                        if piece.is_empty() {
                            continue;
                        }
                        response_text.push_str(&piece);
                        let frame = StreamResponse::content_chunk(&id, &model, created, piece);
                        if let Ok(data) = serde_json::to_string(&frame) {
                            yield Ok::<_, std::io::Error>(SseEvent::data(data).to_bytes());
                        }
                        if library_chunk.finish {
                            if let Ok(data) = serde_json::to_string(&StreamResponse::stop_chunk(
                                &id, &model, created,
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
    fn test_request_carries_library_id_and_last_query() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "gpt-3.5-turbo",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "ack"},
                {"role": "user", "content": "what is a relay?"}
            ],
            "stream": true
        }))
        .unwrap();
        let body = build_request_body(&request, "lib-9");
        assert_eq!(body["query"], "what is a relay?");
        assert_eq!(body["libraryId"], "lib-9");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_documents_markdown() {
        let documents = vec![LibraryDocument {
            title: "Guide".to_string(),
            url: "https://example.com/guide".to_string(),
        }];
        let markdown = documents_to_markdown(&documents);
        assert!(markdown.contains("1. [Guide](https://example.com/guide)"));
        assert!(documents_to_markdown(&[]).is_empty());
    }
}
