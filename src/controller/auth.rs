use axum::http::{HeaderMap, StatusCode};
use reqwest::header::AUTHORIZATION;
use tracing::warn;

use crate::database::ability;
use crate::database::channel::Channel;
use crate::database::token::{self, TokenError};
use crate::database::user;
use crate::relay::provider::{CHANNEL_TYPE_AIPROXY_LIBRARY, CHANNEL_TYPE_AZURE};
use crate::relay::types::RelayError;
use crate::relay::RelayContext;

const BEARER_PREFIX: &str = "Bearer ";

fn parse_bearer_key(headers: &HeaderMap) -> Result<String, RelayError> {
    let unauthorized = |message: &str| {
        RelayError::wrap(message, "invalid_api_key", StatusCode::UNAUTHORIZED)
    };
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized("missing Authorization header"))?;
    let value = value
        .to_str()
        .map_err(|_| unauthorized("invalid characters in Authorization header"))?;
    let key = value
        .strip_prefix(BEARER_PREFIX)
        .unwrap_or(value)
        .trim()
        .trim_start_matches("sk-");
    if key.is_empty() {
        return Err(unauthorized("missing API key"));
    }
    Ok(key.to_string())
}

fn map_token_error(err: TokenError) -> RelayError {
    match err {
        TokenError::Invalid => {
            RelayError::wrap("invalid API key", "invalid_api_key", StatusCode::UNAUTHORIZED)
        }
        TokenError::Disabled => RelayError::wrap(
            "this API key has been disabled",
            "api_key_disabled",
            StatusCode::UNAUTHORIZED,
        ),
        TokenError::Expired => RelayError::wrap(
            "this API key has expired",
            "api_key_expired",
            StatusCode::UNAUTHORIZED,
        ),
        TokenError::Exhausted => RelayError::wrap(
            "this API key has no quota left",
            "api_key_exhausted",
            StatusCode::FORBIDDEN,
        ),
        other => RelayError::wrap(
            other.to_string(),
            "authentication_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

/// Resolves the bearer token and picks an upstream channel for the model,
/// producing the context hints the pipeline consumes. The channel's `other`
/// column doubles as the Azure api-version or the AIProxy library id,
/// depending on the channel type.
pub async fn authenticate_and_distribute(
    headers: &HeaderMap,
    model: &str,
) -> Result<RelayContext, RelayError> {
    let key = parse_bearer_key(headers)?;

    let token = tokio::task::spawn_blocking(move || token::validate_token(&key))
        .await
        .map_err(|e| {
            RelayError::wrap(
                format!("authentication task failed: {}", e),
                "authentication_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?
        .map_err(map_token_error)?;

    let user_id = token.user_id;
    let group = tokio::task::spawn_blocking(move || user::get_user_group(user_id))
        .await
        .map_err(|e| {
            RelayError::wrap(
                format!("authentication task failed: {}", e),
                "authentication_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?
        .map_err(|e| {
            RelayError::wrap(
                format!("failed to resolve user group: {}", e),
                "get_user_group_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?;

    let group_for_choice = group.clone();
    let model_for_choice = model.to_string();
    let channel = tokio::task::spawn_blocking(move || {
        ability::get_random_satisfied_channel(&group_for_choice, &model_for_choice)
    })
    .await
    .map_err(|e| {
        RelayError::wrap(
            format!("channel selection task failed: {}", e),
            "get_channel_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?
    .map_err(|e| {
        warn!("no channel for group {} model {}: {}", group, model, e);
        RelayError::wrap(
            format!("no available channel for model {}", model),
            "no_channel_available",
            StatusCode::SERVICE_UNAVAILABLE,
        )
    })?;

    Ok(build_relay_context(&channel, token.id, user_id, group, token.name))
}

fn build_relay_context(
    channel: &Channel,
    token_id: i64,
    user_id: i64,
    group: String,
    token_name: String,
) -> RelayContext {
    RelayContext {
        channel_type: channel.channel_type,
        channel_id: channel.id,
        channel_key: channel.channel_key.clone(),
        token_id,
        user_id,
        group,
        token_name,
        model_mapping: channel.model_mapping.clone(),
        base_url: channel.base_url.clone(),
        full_url: channel.full_url.clone(),
        library_id: if channel.channel_type == CHANNEL_TYPE_AIPROXY_LIBRARY {
            channel.other.clone()
        } else {
            String::new()
        },
        async_num: channel.async_num,
        api_version: if channel.channel_type == CHANNEL_TYPE_AZURE {
            channel.other.clone()
        } else {
            String::new()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::try_from(value).unwrap());
        headers
    }

    #[test]
    fn test_parse_bearer_key_strips_prefixes() {
        let headers = headers_with_auth("Bearer sk-abc123");
        assert_eq!(parse_bearer_key(&headers).unwrap(), "abc123");

        let headers = headers_with_auth("sk-abc123");
        assert_eq!(parse_bearer_key(&headers).unwrap(), "abc123");

        let headers = headers_with_auth("Bearer plain-key");
        assert_eq!(parse_bearer_key(&headers).unwrap(), "plain-key");
    }

    #[test]
    fn test_parse_bearer_key_rejects_missing() {
        assert!(parse_bearer_key(&HeaderMap::new()).is_err());
        let headers = headers_with_auth("Bearer ");
        assert!(parse_bearer_key(&headers).is_err());
    }

    #[test]
    fn test_context_routes_other_column_by_channel_type() {
        let channel = Channel {
            id: 7,
            channel_type: CHANNEL_TYPE_AZURE,
            channel_key: "azure-key".to_string(),
            name: "azure".to_string(),
            status: 1,
            weight: 0,
            priority: 0,
            async_num: 2,
            base_url: "https://example.openai.azure.com".to_string(),
            full_url: String::new(),
            other: "2023-05-15".to_string(),
            models: "gpt-4".to_string(),
            channel_group: "default".to_string(),
            model_mapping: String::new(),
            used_quota: 0,
            created_time: 0,
            test_time: 0,
            response_time: 0,
        };
        let ctx = build_relay_context(&channel, 1, 2, "default".to_string(), "t".to_string());
        assert_eq!(ctx.api_version, "2023-05-15");
        assert_eq!(ctx.library_id, "");
        assert_eq!(ctx.async_num, 2);

        let mut library_channel = channel;
        library_channel.channel_type = CHANNEL_TYPE_AIPROXY_LIBRARY;
        library_channel.other = "lib-1".to_string();
        let ctx = build_relay_context(&library_channel, 1, 2, "default".to_string(), "t".to_string());
        assert_eq!(ctx.library_id, "lib-1");
        assert_eq!(ctx.api_version, "");
    }
}
