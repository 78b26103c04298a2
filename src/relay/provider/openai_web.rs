use std::net::Ipv4Addr;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::relay::types::GeneralRequest;

pub fn full_url(base_url: &str) -> String {
    format!("{}/backend-api/conversation", base_url)
}

// Egress ranges the spoofed client addresses are drawn from.
const IP_RANGES: &[(Ipv4Addr, Ipv4Addr)] = &[
    (Ipv4Addr::new(5, 253, 36, 0), Ipv4Addr::new(5, 253, 36, 255)),
    (Ipv4Addr::new(103, 108, 229, 0), Ipv4Addr::new(103, 108, 229, 255)),
    (Ipv4Addr::new(185, 30, 32, 0), Ipv4Addr::new(185, 30, 33, 255)),
];

pub fn random_ip_from_ranges<R: Rng>(rng: &mut R) -> Ipv4Addr {
    let (start, end) = IP_RANGES[rng.random_range(0..IP_RANGES.len())];
    let start = u32::from(start);
    let end = u32::from(end);
    Ipv4Addr::from(rng.random_range(start..=end))
}

/// The conversation backend fingerprints clients by address; each relayed
/// call presents a fresh address from the configured ranges.
pub fn apply_spoofed_ip_headers(headers: &mut HeaderMap) {
    let ip = random_ip_from_ranges(&mut rand::rng()).to_string();
    if let Ok(value) = HeaderValue::try_from(ip.clone()) {
        headers.insert("x-real-ip", value);
    }
    if let Ok(value) = HeaderValue::try_from(format!(
        "2a06:98c0:3600::103, 2a0e:97c0:7d4:ff31::a,5.253.36.142,{}",
        ip
    )) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::try_from(ip) {
        headers.insert("remote-host", value);
    }
}

#[derive(Debug, Serialize)]
struct WebAuthor {
    role: String,
}

#[derive(Debug, Serialize)]
struct WebContent {
    content_type: String,
    parts: Vec<String>,
}

#[derive(Debug, Serialize)]
struct WebMessage {
    id: String,
    author: WebAuthor,
    content: WebContent,
}

#[derive(Debug, Serialize)]
struct WebConversationRequest {
    action: String,
    messages: Vec<WebMessage>,
    parent_message_id: String,
    model: String,
}

fn web_model_name(model: &str) -> String {
    if model.starts_with("gpt-4") {
        "gpt-4".to_string()
    } else {
        "text-davinci-002-render-sha".to_string()
    }
}

pub fn build_request_body(request: &GeneralRequest) -> Value {
    let messages = request
        .messages
        .iter()
        .map(|message| WebMessage {
            id: Uuid::new_v4().to_string(),
            author: WebAuthor {
                role: message.role.clone(),
            },
            content: WebContent {
                content_type: "text".to_string(),
                parts: vec![message.content.clone()],
            },
        })
        .collect();
    let web_request = WebConversationRequest {
        action: "next".to_string(),
        messages,
        parent_message_id: Uuid::new_v4().to_string(),
        model: web_model_name(&request.model),
    };
    serde_json::to_value(web_request).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    #[test]
    fn test_random_ip_stays_in_ranges() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let ip = random_ip_from_ranges(&mut rng);
            let as_u32 = u32::from(ip);
            let contained = IP_RANGES
                .iter()
                .any(|(start, end)| as_u32 >= u32::from(*start) && as_u32 <= u32::from(*end));
            assert!(contained, "{} escaped the configured ranges", ip);
        }
    }

    #[test]
    fn test_spoofed_headers_present() {
        let mut headers = HeaderMap::new();
        apply_spoofed_ip_headers(&mut headers);
        assert!(headers.contains_key("x-real-ip"));
        assert!(headers.contains_key("remote-host"));
        let forwarded = headers.get("x-forwarded-for").unwrap().to_str().unwrap();
        assert!(forwarded.starts_with("2a06:98c0:3600::103"));
        assert_eq!(
            headers.get("x-real-ip").unwrap().to_str().unwrap(),
            forwarded.rsplit(',').next().unwrap()
        );
    }

    #[test]
    fn test_conversation_request_shape() {
        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let body = build_request_body(&request);
        assert_eq!(body["action"], "next");
        assert_eq!(body["model"], "text-davinci-002-render-sha");
        assert_eq!(body["messages"][0]["content"]["parts"][0], "hi");
        assert_eq!(body["messages"][0]["author"]["role"], "user");

        let request: GeneralRequest = serde_json::from_value(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert_eq!(build_request_body(&request)["model"], "gpt-4");
    }
}
