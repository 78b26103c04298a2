use axum::{
    body::{Body, Bytes},
    http::StatusCode,
    response::Response,
};
use futures::StreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use serde_json::Value;
use std::io::Read;
use tracing::{debug, error};

use crate::relay::settle::Settlement;
use crate::relay::token_count;
use crate::relay::types::{OpenAiError, RelayError, RelayMode, Usage};
use crate::utils::sse::{SseEvent, SseParser};

pub const CLOUDFLARE_GATEWAY_PREFIX: &str = "https://gateway.ai.cloudflare.com";

/// Deployment names on Azure carry no dots and no snapshot suffix.
pub fn sanitize_azure_model(model: &str) -> String {
    let mut name = model;
    for suffix in ["-0301", "-0314", "-0613", ".0301", ".0314", ".0613"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped;
            break;
        }
    }
    name.replace('.', "")
}

/// Azure rewrites the task path onto the deployment:
/// `/openai/deployments/{model}/{task}?api-version=...`
pub fn azure_full_url(base_url: &str, api_version: &str, model: &str, request_path: &str) -> String {
    let path = request_path.split('?').next().unwrap_or(request_path);
    let task = path.strip_prefix("/v1/").unwrap_or(path);
    format!(
        "{}/openai/deployments/{}/{}?api-version={}",
        base_url,
        sanitize_azure_model(model),
        task,
        api_version
    )
}

/// Plain OpenAI-compatible URL; the Cloudflare AI Gateway variant already
/// embeds the account/provider segments, so the `/v1` prefix is dropped.
pub fn openai_full_url(base_url: &str, request_path: &str) -> String {
    if base_url.starts_with(CLOUDFLARE_GATEWAY_PREFIX) {
        let trimmed = request_path.strip_prefix("/v1").unwrap_or(request_path);
        format!("{}{}", base_url, trimmed)
    } else {
        format!("{}{}", base_url, request_path)
    }
}

fn decode_body(body: Bytes, is_gzip: bool) -> Bytes {
    if !is_gzip || body.is_empty() {
        return body;
    }
    let mut decoder = flate2::read::GzDecoder::new(&body[..]);
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => Bytes::from(decompressed),
        Err(e) => {
            error!("gzip decoding failed: {}", e);
            body
        }
    }
}

fn forwarded_response_builder(response: &reqwest::Response) -> axum::http::response::Builder {
    let mut builder = Response::builder().status(response.status().as_u16());
    for (name, value) in response.headers() {
        if name != CONTENT_LENGTH && name != CONTENT_ENCODING && name != TRANSFER_ENCODING {
            builder = builder.header(name, value);
        }
    }
    builder
}

/// Non-streaming handler: relays the upstream body verbatim and settles from
/// the reported usage, falling back to counting the choices when the
/// upstream omits token counts.
pub async fn handler(
    response: reqwest::Response,
    prompt_tokens: i64,
    model: &str,
    settlement: Settlement,
) -> Result<Response<Body>, RelayError> {
    let builder = forwarded_response_builder(&response);
    let is_gzip = response
        .headers()
        .get(CONTENT_ENCODING)
        .is_some_and(|v| v.to_str().unwrap_or("").contains("gzip"));
    let body = response.bytes().await.map_err(|e| {
        RelayError::wrap(
            format!("failed to read upstream response body: {}", e),
            "read_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    let body = decode_body(body, is_gzip);

    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    if let Some(error_value) = parsed.get("error").filter(|v| !v.is_null()) {
        if let Ok(upstream) = serde_json::from_value::<OpenAiError>(error_value.clone()) {
            if !upstream.error_type.is_empty() {
                // The settlement guard refunds the preconsumed amount.
                drop(settlement);
                return Err(RelayError::from_upstream(StatusCode::BAD_GATEWAY, upstream));
            }
        }
    }

    let usage = parse_usage(&parsed).unwrap_or_else(|| {
        let completion: i64 = parsed["choices"]
            .as_array()
            .map(|choices| {
                choices
                    .iter()
                    .map(|choice| {
                        let content = choice["message"]["content"].as_str().unwrap_or("");
                        token_count::count_text(content, model)
                    })
                    .sum()
            })
            .unwrap_or(0);
        Usage::new(prompt_tokens, completion)
    });
    settlement.complete(usage);

    Ok(builder.body(Body::from(body)).unwrap())
}

pub fn parse_usage(body: &Value) -> Option<Usage> {
    let usage = body.get("usage")?;
    let total_tokens = usage.get("total_tokens").and_then(Value::as_i64)?;
    if total_tokens == 0 {
        return None;
    }
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0),
        completion_tokens: usage.get("completion_tokens").and_then(Value::as_i64).unwrap_or(0),
        total_tokens,
    })
}

fn extract_stream_text(data: &str, relay_mode: RelayMode) -> String {
    let Ok(chunk) = serde_json::from_str::<Value>(data) else {
        return String::new();
    };
    let Some(choices) = chunk["choices"].as_array() else {
        return String::new();
    };
    let mut text = String::new();
    for choice in choices {
        let piece = match relay_mode {
            RelayMode::ChatCompletions => choice["delta"]["content"].as_str(),
            _ => choice["text"].as_str(),
        };
        if let Some(piece) = piece {
            text.push_str(piece);
        }
    }
    text
}

/// Streaming handler: relays upstream events in arrival order and counts the
/// completion text as it flows, settling when the stream finishes (or the
/// client gives up; the settlement guard covers that path).
pub fn stream_handler(
    response: reqwest::Response,
    relay_mode: RelayMode,
    model: &str,
    prompt_tokens: i64,
    settlement: Settlement,
) -> Response<Body> {
    let model = model.to_string();

    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut response_text = String::new();
        let settlement = settlement;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in parser.process(&chunk) {
                        if event.is_done() {
                            yield Ok::<_, std::io::Error>(SseEvent::data("[DONE]").to_bytes());
                            continue;
                        }
                        response_text.push_str(&extract_stream_text(&event.data, relay_mode));
                        yield Ok(event.to_bytes());
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

        let completion_tokens = token_count::count_text(&response_text, &model);
        debug!("stream completed, counted {} completion tokens", completion_tokens);
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
    fn test_sanitize_azure_model() {
        assert_eq!(sanitize_azure_model("gpt-4.0613"), "gpt-4");
        assert_eq!(sanitize_azure_model("gpt-3.5-turbo-0613"), "gpt-35-turbo");
        assert_eq!(sanitize_azure_model("gpt-3.5-turbo"), "gpt-35-turbo");
        assert_eq!(sanitize_azure_model("gpt-4-0314"), "gpt-4");
        assert_eq!(sanitize_azure_model("gpt-4-32k"), "gpt-4-32k");
    }

    #[test]
    fn test_azure_full_url() {
        let url = azure_full_url(
            "https://example.openai.azure.com",
            "2023-05-15",
            "gpt-4.0613",
            "/v1/chat/completions?foo=bar",
        );
        assert_eq!(
            url,
            "https://example.openai.azure.com/openai/deployments/gpt-4/chat/completions?api-version=2023-05-15"
        );
    }

    #[test]
    fn test_cloudflare_gateway_strips_v1() {
        let base = "https://gateway.ai.cloudflare.com/v1/acct/gw/openai";
        assert_eq!(
            openai_full_url(base, "/v1/chat/completions"),
            "https://gateway.ai.cloudflare.com/v1/acct/gw/openai/chat/completions"
        );
        assert_eq!(
            openai_full_url("https://api.openai.com", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_parse_usage() {
        let body = json!({"usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}});
        let usage = parse_usage(&body).unwrap();
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 12);
        assert_eq!(usage.total_tokens, 21);
        assert!(parse_usage(&json!({"usage": {"total_tokens": 0}})).is_none());
        assert!(parse_usage(&json!({})).is_none());
    }

    #[test]
    fn test_extract_stream_text_chat_and_completions() {
        let chat = r#"{"choices":[{"delta":{"content":"hel"}},{"delta":{"content":"lo"}}]}"#;
        assert_eq!(extract_stream_text(chat, RelayMode::ChatCompletions), "hello");

        let completions = r#"{"choices":[{"text":"hi"}]}"#;
        assert_eq!(extract_stream_text(completions, RelayMode::Completions), "hi");

        assert_eq!(extract_stream_text("not json", RelayMode::ChatCompletions), "");
    }
}
