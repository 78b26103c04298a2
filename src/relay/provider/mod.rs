use axum::http::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tracing::debug;

use super::types::{OpenAiError, RelayError};

pub mod aiproxy;
pub mod ali;
pub mod baidu;
pub mod claude;
pub mod openai;
pub mod openai_web;
pub mod palm;
pub mod tencent;
pub mod xunfei;
pub mod zhipu;

// Channel type tags as stored on the channel row.
pub const CHANNEL_TYPE_OPENAI: i32 = 1;
pub const CHANNEL_TYPE_AZURE: i32 = 3;
pub const CHANNEL_TYPE_PALM: i32 = 11;
pub const CHANNEL_TYPE_ANTHROPIC: i32 = 14;
pub const CHANNEL_TYPE_BAIDU: i32 = 15;
pub const CHANNEL_TYPE_ZHIPU: i32 = 16;
pub const CHANNEL_TYPE_ALI: i32 = 17;
pub const CHANNEL_TYPE_XUNFEI: i32 = 18;
pub const CHANNEL_TYPE_AIPROXY_LIBRARY: i32 = 21;
pub const CHANNEL_TYPE_TENCENT: i32 = 23;
pub const CHANNEL_TYPE_OPENAI_WEB: i32 = 24;

/// The switch key for the translator set. Several channel types share the
/// OpenAI wire shape (Azure included); each remaining provider has its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    OpenAi,
    Claude,
    PaLM,
    Baidu,
    Zhipu,
    Ali,
    Xunfei,
    AiProxyLibrary,
    Tencent,
    OpenAiWeb,
}

impl ApiType {
    pub fn from_channel_type(channel_type: i32) -> ApiType {
        match channel_type {
            CHANNEL_TYPE_ANTHROPIC => ApiType::Claude,
            CHANNEL_TYPE_BAIDU => ApiType::Baidu,
            CHANNEL_TYPE_PALM => ApiType::PaLM,
            CHANNEL_TYPE_ZHIPU => ApiType::Zhipu,
            CHANNEL_TYPE_ALI => ApiType::Ali,
            CHANNEL_TYPE_XUNFEI => ApiType::Xunfei,
            CHANNEL_TYPE_AIPROXY_LIBRARY => ApiType::AiProxyLibrary,
            CHANNEL_TYPE_TENCENT => ApiType::Tencent,
            CHANNEL_TYPE_OPENAI_WEB => ApiType::OpenAiWeb,
            _ => ApiType::OpenAi,
        }
    }
}

/// Default upstream base URL per channel type.
pub fn channel_base_url(channel_type: i32) -> &'static str {
    match channel_type {
        CHANNEL_TYPE_OPENAI => "https://api.openai.com",
        CHANNEL_TYPE_PALM => "https://generativelanguage.googleapis.com",
        CHANNEL_TYPE_ANTHROPIC => "https://api.anthropic.com",
        CHANNEL_TYPE_BAIDU => "https://aip.baidubce.com",
        CHANNEL_TYPE_ZHIPU => "https://open.bigmodel.cn",
        CHANNEL_TYPE_ALI => "https://dashscope.aliyuncs.com",
        CHANNEL_TYPE_TENCENT => "https://hunyuan.cloud.tencent.com",
        _ => "",
    }
}

/// Writes the outbound credential the way the chosen provider expects it.
/// One universal rule sits on top: a credential containing the substring
/// `ignore` suppresses the Authorization header entirely. This is a debug
/// and forwarding convenience (the operator parks `ignore` in a channel key
/// to relay caller-supplied credentials untouched) and is deliberate,
/// documented behavior.
pub fn apply_auth_headers(
    headers: &mut HeaderMap,
    api_type: ApiType,
    channel_type: i32,
    credential: &str,
) -> Result<(), RelayError> {
    let bearer = |value: &str| {
        HeaderValue::try_from(format!("Bearer {}", value)).map_err(|_| {
            RelayError::wrap(
                "credential contains invalid header characters",
                "invalid_channel_key",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })
    };

    match api_type {
        ApiType::OpenAi if channel_type == CHANNEL_TYPE_AZURE => {
            headers.insert("api-key", HeaderValue::try_from(credential).map_err(|_| {
                RelayError::wrap(
                    "credential contains invalid header characters",
                    "invalid_azure_config",
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            })?);
            headers.remove(AUTHORIZATION);
        }
        ApiType::OpenAi | ApiType::OpenAiWeb | ApiType::AiProxyLibrary => {
            headers.insert(AUTHORIZATION, bearer(credential)?);
        }
        ApiType::Claude => {
            headers.insert("x-api-key", HeaderValue::try_from(credential).map_err(|_| {
                RelayError::wrap(
                    "credential contains invalid header characters",
                    "invalid_claude_config",
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            })?);
            if !headers.contains_key("anthropic-version") {
                headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
            }
            headers.remove(AUTHORIZATION);
        }
        ApiType::Zhipu => {
            let token = zhipu::get_zhipu_token(credential)?;
            headers.insert(AUTHORIZATION, HeaderValue::try_from(token).map_err(|_| {
                RelayError::wrap(
                    "generated token contains invalid header characters",
                    "invalid_zhipu_config",
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            })?);
        }
        ApiType::Ali => {
            headers.insert(AUTHORIZATION, bearer(credential)?);
        }
        ApiType::Tencent => {
            // The signature replaces the credential; written by the request
            // adapter after the body is final.
        }
        ApiType::PaLM | ApiType::Baidu => {
            // Credential travels in the URL query for these providers.
            headers.remove(AUTHORIZATION);
        }
        ApiType::Xunfei => {
            // Signed into the websocket URL by the xunfei adapter.
        }
    }

    if credential.contains("ignore") {
        debug!("credential carries the ignore marker, stripping Authorization");
        headers.remove(AUTHORIZATION);
    }
    Ok(())
}

/// Translates an upstream non-2xx response into the canonical envelope,
/// preserving the upstream status code.
pub async fn relay_error_handler(response: reqwest::Response) -> RelayError {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = response.bytes().await.unwrap_or_default();

    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        if let Some(error_value) = value.get("error") {
            if let Ok(error) = serde_json::from_value::<OpenAiError>(error_value.clone()) {
                return RelayError::from_upstream(status, error);
            }
        }
    }
    RelayError::from_upstream(
        status,
        OpenAiError {
            message: String::from_utf8_lossy(&body).into_owned(),
            error_type: "upstream_error".to_string(),
            param: String::new(),
            code: Value::String("bad_response_status_code".to_string()),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_type_mapping() {
        assert_eq!(ApiType::from_channel_type(CHANNEL_TYPE_OPENAI), ApiType::OpenAi);
        assert_eq!(ApiType::from_channel_type(CHANNEL_TYPE_AZURE), ApiType::OpenAi);
        assert_eq!(ApiType::from_channel_type(CHANNEL_TYPE_ANTHROPIC), ApiType::Claude);
        assert_eq!(ApiType::from_channel_type(CHANNEL_TYPE_TENCENT), ApiType::Tencent);
        assert_eq!(ApiType::from_channel_type(999), ApiType::OpenAi);
    }

    #[test]
    fn test_azure_uses_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
        apply_auth_headers(&mut headers, ApiType::OpenAi, CHANNEL_TYPE_AZURE, "azure-key").unwrap();
        assert_eq!(headers.get("api-key").unwrap(), "azure-key");
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_claude_gets_default_version_header() {
        let mut headers = HeaderMap::new();
        apply_auth_headers(&mut headers, ApiType::Claude, CHANNEL_TYPE_ANTHROPIC, "sk-ant").unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn test_claude_keeps_caller_version_header() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", HeaderValue::from_static("2023-01-01"));
        apply_auth_headers(&mut headers, ApiType::Claude, CHANNEL_TYPE_ANTHROPIC, "sk-ant").unwrap();
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-01-01");
    }

    #[test]
    fn test_ignore_marker_strips_authorization() {
        let mut headers = HeaderMap::new();
        apply_auth_headers(&mut headers, ApiType::OpenAi, CHANNEL_TYPE_OPENAI, "sk-ignore-me")
            .unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_plain_openai_bearer() {
        let mut headers = HeaderMap::new();
        apply_auth_headers(&mut headers, ApiType::OpenAi, CHANNEL_TYPE_OPENAI, "sk-abc").unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-abc");
    }
}
