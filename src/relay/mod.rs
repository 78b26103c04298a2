use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::Bytes;
use reqwest::header::{
    HeaderValue, ACCEPT, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
};
use serde_json::Value;
use tracing::{info, warn};

pub mod dispatch;
pub mod provider;
pub mod settle;
pub mod token_count;
pub mod types;

use dispatch::{async_http_do, http_do, PreparedRequest};
use provider::{channel_base_url, ApiType, CHANNEL_TYPE_AZURE};
use settle::{SettleContext, Settlement};
use types::{GeneralRequest, RelayError, RelayMode};

use crate::config::CONFIG;
use crate::service::{quota, ratio};

/// Request-scoped hints resolved by the authentication layer and channel
/// selection before the pipeline runs.
#[derive(Debug, Clone, Default)]
pub struct RelayContext {
    pub channel_type: i32,
    pub channel_id: i64,
    /// The channel's upstream credential.
    pub channel_key: String,
    pub token_id: i64,
    pub user_id: i64,
    pub group: String,
    pub token_name: String,
    pub model_mapping: String,
    pub base_url: String,
    pub full_url: String,
    pub library_id: String,
    pub async_num: i32,
    /// Azure deployment api-version; a query override wins over the channel
    /// configuration.
    pub api_version: String,
}

fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn validate_request(request: &GeneralRequest, relay_mode: RelayMode) -> Result<(), RelayError> {
    let missing = |field: &str| {
        Err(RelayError::wrap(
            format!("field {} is required", field),
            "required_field_missing",
            StatusCode::BAD_REQUEST,
        ))
    };
    if request.model.is_empty() {
        return Err(RelayError::wrap(
            "model is required",
            "required_field_missing",
            StatusCode::BAD_REQUEST,
        ));
    }
    match relay_mode {
        RelayMode::ChatCompletions if request.messages.is_empty() => missing("messages"),
        RelayMode::Completions if value_is_empty(&request.prompt) => missing("prompt"),
        RelayMode::Moderations if value_is_empty(&request.input) => missing("input"),
        RelayMode::Edits if request.instruction.is_empty() => missing("instruction"),
        _ => Ok(()),
    }
}

/// Applies the channel's model mapping; returns whether the name changed.
fn apply_model_mapping(request: &mut GeneralRequest, mapping: &str) -> Result<bool, RelayError> {
    if mapping.is_empty() || mapping == "{}" {
        return Ok(false);
    }
    let map: std::collections::HashMap<String, String> =
        serde_json::from_str(mapping).map_err(|e| {
            RelayError::wrap(
                format!("invalid model mapping: {}", e),
                "unmarshal_model_mapping_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?;
    if let Some(mapped) = map.get(&request.model).filter(|m| !m.is_empty()) {
        request.model = mapped.clone();
        return Ok(true);
    }
    Ok(false)
}

/// Outbound headers start from the inbound set; hop and negotiation headers
/// that no longer hold are dropped before the provider credential lands.
fn build_outbound_headers(inbound: &HeaderMap, is_stream: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if name != HOST && name != CONTENT_LENGTH && name != ACCEPT_ENCODING {
            headers.insert(name.clone(), value.clone());
        }
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    if is_stream && !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }
    headers
}

/// The relay pipeline: validate, map the model, resolve the provider URL,
/// estimate and preconsume quota, translate, dispatch, and hand the response
/// to the provider's handler, which settles the ledger when it finishes.
pub async fn relay_text(
    ctx: RelayContext,
    relay_mode: RelayMode,
    request_path: &str,
    inbound_headers: &HeaderMap,
    body: Bytes,
    path_model: Option<&str>,
) -> Result<Response<Body>, RelayError> {
    let mut text_request: GeneralRequest = serde_json::from_slice(&body).map_err(|e| {
        RelayError::wrap(
            format!("failed to parse request body: {}", e),
            "bind_request_body_failed",
            StatusCode::BAD_REQUEST,
        )
    })?;
    if relay_mode == RelayMode::Moderations && text_request.model.is_empty() {
        text_request.model = "text-moderation-latest".to_string();
    }
    if relay_mode == RelayMode::Embeddings && text_request.model.is_empty() {
        text_request.model = path_model.unwrap_or_default().to_string();
    }
    validate_request(&text_request, relay_mode)?;

    // Pricing always follows the caller-visible name; the mapped name goes
    // into outbound bodies and token counting.
    let original_model = text_request.model.clone();
    let is_model_mapped = apply_model_mapping(&mut text_request, &ctx.model_mapping)?;
    let api_type = ApiType::from_channel_type(ctx.channel_type);
    let is_stream = text_request.stream;

    info!(
        "relaying {:?} model={} channel={} user={} token={} stream={}",
        relay_mode, original_model, ctx.channel_id, ctx.user_id, ctx.token_id, is_stream
    );

    // Token cost estimate for the preconsume.
    let count_model = text_request.model.clone();
    let prompt_tokens = match relay_mode {
        RelayMode::ChatCompletions => {
            token_count::count_messages(&text_request.messages, &count_model)
        }
        RelayMode::Completions => token_count::count_input(&text_request.prompt, &count_model),
        RelayMode::Moderations => token_count::count_input(&text_request.input, &count_model),
        _ => 0,
    };
    let pre_consumed_tokens = if text_request.max_tokens == 0 {
        CONFIG.pre_consumed_quota
    } else {
        prompt_tokens + text_request.max_tokens
    };
    let model_ratio = ratio::get_model_ratio(&original_model);
    let group_ratio = ratio::get_group_ratio(&ctx.group);
    let ratio = model_ratio * group_ratio;
    let mut pre_consumed_quota = (pre_consumed_tokens as f64 * ratio) as i64;

    let user_quota = quota::cache_get_user_quota(ctx.user_id).await.map_err(|e| {
        RelayError::wrap(
            format!("failed to read user quota: {}", e),
            "get_user_quota_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    if user_quota - pre_consumed_quota < 0 {
        return Err(RelayError::wrap(
            "user quota is not enough",
            "insufficient_user_quota",
            StatusCode::FORBIDDEN,
        ));
    }
    quota::cache_decrease_user_quota(ctx.user_id, pre_consumed_quota).await;
    if user_quota > 100 * pre_consumed_quota {
        // Trusted caller: plenty of headroom, skip the tentative deduction.
        pre_consumed_quota = 0;
        info!(
            "user {} has enough quota {}, trusted and no need to pre-consume",
            ctx.user_id, user_quota
        );
    }
    if pre_consumed_quota > 0 {
        let token_id = ctx.token_id;
        let amount = pre_consumed_quota;
        tokio::task::spawn_blocking(move || quota::pre_consume_token_quota(token_id, amount))
            .await
            .map_err(|e| {
                RelayError::wrap(
                    format!("preconsume task failed: {}", e),
                    "pre_consume_token_quota_failed",
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            })?
            .map_err(|e| {
                RelayError::wrap(
                    e.to_string(),
                    "pre_consume_token_quota_failed",
                    StatusCode::FORBIDDEN,
                )
            })?;
    }

    // From here on the guard owns reconciliation: completing settles with
    // real usage, dropping refunds the preconsumed amount.
    let settlement = Settlement::new(SettleContext {
        user_id: ctx.user_id,
        token_id: ctx.token_id,
        channel_id: ctx.channel_id,
        token_name: ctx.token_name.clone(),
        model_name: original_model.clone(),
        model_ratio,
        group_ratio,
        completion_ratio: ratio::get_completion_ratio(&original_model),
        pre_consumed_quota,
    });

    // Xunfei speaks websocket and owns its dispatch loop.
    if api_type == ApiType::Xunfei {
        return if is_stream {
            provider::xunfei::stream_handler(
                &text_request,
                &ctx.channel_key,
                &ctx.base_url,
                prompt_tokens,
                settlement,
            )
            .await
        } else {
            provider::xunfei::handler(
                &text_request,
                &ctx.channel_key,
                &ctx.base_url,
                prompt_tokens,
                settlement,
            )
            .await
        };
    }

    let base_url = if ctx.base_url.is_empty() {
        channel_base_url(ctx.channel_type).to_string()
    } else {
        ctx.base_url.clone()
    };

    // Resolve the provider URL.
    let mut full_request_url = match api_type {
        ApiType::OpenAi => {
            if ctx.channel_type == CHANNEL_TYPE_AZURE {
                provider::openai::azure_full_url(
                    &base_url,
                    &ctx.api_version,
                    &text_request.model,
                    request_path,
                )
            } else {
                provider::openai::openai_full_url(&base_url, request_path)
            }
        }
        ApiType::Claude => provider::claude::full_url(&base_url),
        ApiType::Baidu => {
            let access_token = provider::baidu::get_access_token(&ctx.channel_key).await?;
            provider::baidu::full_url(&base_url, &text_request.model, &access_token)?
        }
        ApiType::PaLM => provider::palm::full_url(&base_url, &ctx.channel_key),
        ApiType::Zhipu => provider::zhipu::full_url(&base_url, &text_request.model, is_stream),
        ApiType::Ali => provider::ali::full_url(&base_url, relay_mode),
        ApiType::Tencent => provider::tencent::full_url(&base_url),
        ApiType::AiProxyLibrary => provider::aiproxy::full_url(&base_url),
        ApiType::OpenAiWeb => provider::openai_web::full_url(&base_url),
        ApiType::Xunfei => unreachable!("xunfei returned above"),
    };
    if !ctx.full_url.is_empty() && request_path.ends_with("chat/completions") {
        full_request_url = ctx.full_url.clone();
    }

    // Translate the body. The inbound buffer passes through byte-for-byte
    // unless the model was remapped or the provider has its own shape.
    let passthrough = if is_model_mapped {
        Bytes::from(serde_json::to_vec(&text_request).map_err(|e| {
            RelayError::wrap(
                format!("failed to serialize request: {}", e),
                "marshal_text_request_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?)
    } else {
        body
    };
    let mut tencent_sign = None;
    let request_body = match api_type {
        ApiType::OpenAi => passthrough,
        ApiType::Claude => json_body(provider::claude::build_request_body(&text_request))?,
        ApiType::Baidu => json_body(provider::baidu::build_body_for_mode(&text_request, relay_mode))?,
        ApiType::PaLM => json_body(provider::palm::build_request_body(&text_request))?,
        ApiType::Zhipu => json_body(provider::zhipu::build_request_body(&text_request))?,
        ApiType::Ali => json_body(provider::ali::build_body_for_mode(&text_request, relay_mode))?,
        ApiType::Tencent => {
            let (body, sign) =
                provider::tencent::build_signed_request(&text_request, &ctx.channel_key)?;
            tencent_sign = Some(sign);
            json_body(body)?
        }
        ApiType::AiProxyLibrary => {
            json_body(provider::aiproxy::build_request_body(&text_request, &ctx.library_id))?
        }
        ApiType::OpenAiWeb => json_body(provider::openai_web::build_request_body(&text_request))?,
        ApiType::Xunfei => unreachable!("xunfei returned above"),
    };

    // Headers: inbound minus hop headers, then the provider credential.
    let mut headers = build_outbound_headers(inbound_headers, is_stream);
    provider::apply_auth_headers(&mut headers, api_type, ctx.channel_type, &ctx.channel_key)?;
    if let Some(sign) = tencent_sign {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::try_from(sign).map_err(|_| {
                RelayError::wrap(
                    "signature contains invalid header characters",
                    "invalid_tencent_config",
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            })?,
        );
    }
    if api_type == ApiType::Ali && is_stream {
        headers.insert("x-dashscope-sse", HeaderValue::from_static("enable"));
    }
    if api_type == ApiType::OpenAiWeb {
        provider::openai_web::apply_spoofed_ip_headers(&mut headers);
    }

    let prepared = PreparedRequest {
        method: reqwest::Method::POST,
        url: full_request_url,
        headers,
        body: request_body,
    };
    let async_num = ctx.async_num.max(1) as usize;
    let response = if is_stream {
        async_http_do(prepared, async_num).await
    } else {
        http_do(prepared).await
    }
    .map_err(|e| {
        RelayError::wrap(e.to_string(), "do_request_failed", StatusCode::INTERNAL_SERVER_ERROR)
    })?;

    // Some providers stream without being asked.
    let is_stream = is_stream
        || response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

    if response.status() != reqwest::StatusCode::OK {
        warn!(
            "upstream returned status {} for channel {}",
            response.status(),
            ctx.channel_id
        );
        // Dropping the settlement schedules the refund of the preconsumed
        // amount before the error envelope goes back.
        drop(settlement);
        return Err(provider::relay_error_handler(response).await);
    }

    let count_model = text_request.model.as_str();
    let response = match (api_type, is_stream) {
        (ApiType::OpenAi | ApiType::OpenAiWeb, true) => provider::openai::stream_handler(
            response,
            relay_mode,
            count_model,
            prompt_tokens,
            settlement,
        ),
        (ApiType::OpenAi | ApiType::OpenAiWeb, false) => {
            provider::openai::handler(response, prompt_tokens, count_model, settlement).await?
        }
        (ApiType::Claude, true) => {
            provider::claude::stream_handler(response, count_model, prompt_tokens, settlement)
        }
        (ApiType::Claude, false) => {
            provider::claude::handler(response, prompt_tokens, count_model, settlement).await?
        }
        (ApiType::Baidu, true) => {
            provider::baidu::stream_handler(response, count_model, settlement)
        }
        (ApiType::Baidu, false) => match relay_mode {
            RelayMode::Embeddings => {
                provider::baidu::embedding_handler(response, count_model, settlement).await?
            }
            _ => provider::baidu::handler(response, settlement).await?,
        },
        (ApiType::PaLM, true) => {
            provider::palm::stream_handler(response, count_model, prompt_tokens, settlement)
        }
        (ApiType::PaLM, false) => {
            provider::palm::handler(response, prompt_tokens, count_model, settlement).await?
        }
        (ApiType::Zhipu, true) => {
            provider::zhipu::stream_handler(response, count_model, settlement)
        }
        (ApiType::Zhipu, false) => provider::zhipu::handler(response, settlement).await?,
        (ApiType::Ali, true) => provider::ali::stream_handler(response, count_model, settlement),
        (ApiType::Ali, false) => match relay_mode {
            RelayMode::Embeddings => {
                provider::ali::embedding_handler(response, count_model, settlement).await?
            }
            _ => provider::ali::handler(response, settlement).await?,
        },
        (ApiType::Tencent, true) => {
            provider::tencent::stream_handler(response, count_model, prompt_tokens, settlement)
        }
        (ApiType::Tencent, false) => provider::tencent::handler(response, settlement).await?,
        (ApiType::AiProxyLibrary, true) => {
            provider::aiproxy::stream_handler(response, count_model, prompt_tokens, settlement)
        }
        (ApiType::AiProxyLibrary, false) => {
            provider::aiproxy::handler(response, prompt_tokens, count_model, settlement).await?
        }
        (ApiType::Xunfei, _) => unreachable!("xunfei returned above"),
    };
    Ok(response)
}

fn json_body(value: Value) -> Result<Bytes, RelayError> {
    serde_json::to_vec(&value).map(Bytes::from).map_err(|e| {
        RelayError::wrap(
            format!("failed to serialize request: {}", e),
            "marshal_text_request_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_from(value: Value) -> GeneralRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_validation_per_mode() {
        let chat = request_from(json!({"model": "gpt-4"}));
        assert!(validate_request(&chat, RelayMode::ChatCompletions).is_err());

        let chat = request_from(json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}));
        assert!(validate_request(&chat, RelayMode::ChatCompletions).is_ok());

        let completions = request_from(json!({"model": "gpt-3.5-turbo-instruct"}));
        assert!(validate_request(&completions, RelayMode::Completions).is_err());

        let completions = request_from(json!({"model": "gpt-3.5-turbo-instruct", "prompt": "say hi"}));
        assert!(validate_request(&completions, RelayMode::Completions).is_ok());

        let moderations = request_from(json!({"model": "text-moderation-latest", "input": ""}));
        assert!(validate_request(&moderations, RelayMode::Moderations).is_err());

        let edits = request_from(json!({"model": "text-davinci-edit-001", "input": "x"}));
        assert!(validate_request(&edits, RelayMode::Edits).is_err());

        let no_model = request_from(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let err = validate_request(&no_model, RelayMode::ChatCompletions).unwrap_err();
        assert_eq!(err.error.code, json!("required_field_missing"));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_model_mapping_replaces_only_known_names() {
        let mut request = request_from(json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}));
        let mapped =
            apply_model_mapping(&mut request, r#"{"gpt-4": "gpt-4-0613"}"#).unwrap();
        assert!(mapped);
        assert_eq!(request.model, "gpt-4-0613");

        let mut request = request_from(json!({"model": "gpt-3.5-turbo"}));
        let mapped =
            apply_model_mapping(&mut request, r#"{"gpt-4": "gpt-4-0613"}"#).unwrap();
        assert!(!mapped);
        assert_eq!(request.model, "gpt-3.5-turbo");

        let mut request = request_from(json!({"model": "gpt-4"}));
        assert!(!apply_model_mapping(&mut request, "").unwrap());
        assert!(!apply_model_mapping(&mut request, "{}").unwrap());
        assert!(apply_model_mapping(&mut request, "not json").is_err());
    }

    #[test]
    fn test_outbound_headers_drop_hop_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("relay.example.com"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        inbound.insert(ACCEPT_ENCODING, HeaderValue::from_static("br"));
        inbound.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let headers = build_outbound_headers(&inbound, true);
        assert!(headers.get(HOST).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert!(headers.get(ACCEPT_ENCODING).is_none());
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get(ACCEPT).unwrap(), "text/event-stream");
    }

    #[test]
    fn test_value_is_empty() {
        assert!(value_is_empty(&Value::Null));
        assert!(value_is_empty(&json!("")));
        assert!(value_is_empty(&json!([])));
        assert!(!value_is_empty(&json!("hi")));
        assert!(!value_is_empty(&json!(["hi"])));
    }
}
