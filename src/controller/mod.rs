use axum::{
    body::Body,
    extract::{Path, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::relay::types::{RelayError, RelayMode};
use crate::relay::{relay_text, RelayContext};

pub mod auth;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn create_router() -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/completions", post(completions_handler))
        .route("/v1/embeddings", post(embeddings_handler))
        .route("/v1/engines/{model}/embeddings", post(engine_embeddings_handler))
        .route("/v1/moderations", post(moderations_handler))
        .route("/v1/edits", post(edits_handler))
        .route("/v1/images/generations", post(|| not_relayed(RelayMode::ImageGenerations)))
        .route("/v1/audio/transcriptions", post(|| not_relayed(RelayMode::AudioTranscription)))
        .route("/v1/audio/speech", post(|| not_relayed(RelayMode::AudioTts)))
        .fallback(not_found_handler)
}

/// Recognized surfaces this deployment does not relay.
async fn not_relayed(relay_mode: RelayMode) -> Response {
    RelayError::wrap(
        format!("{:?} is not relayed by this deployment", relay_mode),
        "relay_mode_not_supported",
        StatusCode::NOT_IMPLEMENTED,
    )
    .into_response()
}

async fn chat_completions_handler(request: Request<Body>) -> Response {
    relay_handler(RelayMode::ChatCompletions, None, request).await
}

async fn completions_handler(request: Request<Body>) -> Response {
    relay_handler(RelayMode::Completions, None, request).await
}

async fn embeddings_handler(request: Request<Body>) -> Response {
    relay_handler(RelayMode::Embeddings, None, request).await
}

async fn engine_embeddings_handler(
    Path(model): Path<String>,
    request: Request<Body>,
) -> Response {
    relay_handler(RelayMode::Embeddings, Some(model), request).await
}

async fn moderations_handler(request: Request<Body>) -> Response {
    relay_handler(RelayMode::Moderations, None, request).await
}

async fn edits_handler(request: Request<Body>) -> Response {
    relay_handler(RelayMode::Edits, None, request).await
}

async fn not_found_handler() -> Response {
    RelayError::wrap(
        "this endpoint is not relayed",
        "invalid_request_url",
        StatusCode::NOT_FOUND,
    )
    .into_response()
}

/// The model the channel index is asked about must match what the pipeline
/// will relay, including the per-mode defaults applied before validation.
fn peek_model(body: &Bytes, relay_mode: RelayMode, path_model: Option<&str>) -> String {
    let from_body = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("model").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    if !from_body.is_empty() {
        return from_body;
    }
    match relay_mode {
        RelayMode::Moderations => "text-moderation-latest".to_string(),
        RelayMode::Embeddings => path_model.unwrap_or_default().to_string(),
        _ => String::new(),
    }
}

async fn relay_handler(
    relay_mode: RelayMode,
    path_model: Option<String>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let request_path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return RelayError::wrap(
                format!("failed to read request body: {}", e),
                "bind_request_body_failed",
                StatusCode::BAD_REQUEST,
            )
            .into_response()
        }
    };

    let model = peek_model(&body, relay_mode, path_model.as_deref());
    if model.is_empty() {
        // Channel selection needs a model; without one this is a caller
        // error, not a routing failure.
        return RelayError::wrap(
            "model is required",
            "required_field_missing",
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    let mut ctx: RelayContext =
        match auth::authenticate_and_distribute(&parts.headers, &model).await {
            Ok(ctx) => ctx,
            Err(e) => return e.into_response(),
        };
    if let Some(api_version) = query_param(&request_path, "api-version") {
        ctx.api_version = api_version;
    }
    debug!(
        "request {} resolved to channel {} (type {})",
        request_path, ctx.channel_id, ctx.channel_type
    );

    match relay_text(
        ctx,
        relay_mode,
        &request_path,
        &parts.headers,
        body,
        path_model.as_deref(),
    )
    .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

fn query_param(path_and_query: &str, name: &str) -> Option<String> {
    let (_, query) = path_and_query.split_once('?')?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_peek_model_prefers_body() {
        let body = Bytes::from(json!({"model": "gpt-4"}).to_string());
        assert_eq!(peek_model(&body, RelayMode::ChatCompletions, None), "gpt-4");
    }

    #[test]
    fn test_peek_model_defaults() {
        let body = Bytes::from_static(b"{}");
        assert_eq!(
            peek_model(&body, RelayMode::Moderations, None),
            "text-moderation-latest"
        );
        assert_eq!(
            peek_model(&body, RelayMode::Embeddings, Some("text-embedding-ada-002")),
            "text-embedding-ada-002"
        );
        assert_eq!(peek_model(&body, RelayMode::ChatCompletions, None), "");
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param("/v1/chat/completions?api-version=2023-05-15", "api-version"),
            Some("2023-05-15".to_string())
        );
        assert_eq!(query_param("/v1/chat/completions", "api-version"), None);
        assert_eq!(
            query_param("/v1/chat/completions?a=1&api-version=x&b=2", "api-version"),
            Some("x".to_string())
        );
    }
}
