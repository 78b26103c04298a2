use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::database::channel::{self, Channel, CHANNEL_STATUS_AUTO_DISABLED};
use crate::relay::provider::{channel_base_url, ApiType};
use crate::service::{election, sync};

/// Leader-gated channel health probes. Only OpenAI-compatible channels are
/// probed directly; other provider types are exercised by live traffic.
pub fn start_channel_test_loop() {
    if CONFIG.channel_test_interval == 0 {
        return;
    }
    let interval = Duration::from_secs(CONFIG.channel_test_interval);
    tokio::spawn(async move {
        info!("channel test loop started, interval={:?}", interval);
        loop {
            tokio::time::sleep(interval).await;
            if !election::is_master() {
                continue;
            }
            let channels = match channel::get_enabled_channels().await {
                Ok(channels) => channels,
                Err(e) => {
                    warn!("channel test skipped, cannot list channels: {}", e);
                    continue;
                }
            };
            for ch in channels {
                test_channel(&ch).await;
            }
        }
    });
}

async fn test_channel(ch: &Channel) {
    if ApiType::from_channel_type(ch.channel_type) != ApiType::OpenAi {
        return;
    }
    let Some(model) = ch.models.split(',').map(str::trim).find(|m| !m.is_empty()) else {
        return;
    };
    let base = if ch.base_url.is_empty() {
        channel_base_url(ch.channel_type)
    } else {
        ch.base_url.as_str()
    };
    let url = format!("{}/v1/chat/completions", base);
    let body = json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 1,
    });

    let client = reqwest::Client::new();
    let started = Instant::now();
    let result = client
        .post(&url)
        .bearer_auth(&ch.channel_key)
        .json(&body)
        .timeout(Duration::from_secs(30))
        .send()
        .await;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(resp) if resp.status().is_success() => {
            channel::update_channel_response_time(ch.id, elapsed_ms);
        }
        Ok(resp) => {
            warn!("channel {} test returned status {}", ch.id, resp.status());
            channel::update_channel_response_time(ch.id, elapsed_ms);
        }
        Err(e) => {
            warn!("channel {} test failed, auto-disabling: {}", ch.id, e);
            if let Err(db_err) = channel::update_channel_status(ch.id, CHANNEL_STATUS_AUTO_DISABLED)
            {
                warn!("failed to disable channel {}: {}", ch.id, db_err);
                return;
            }
            channel::invalidate_enabled_channels_cache().await;
            sync::publish(sync::TOPIC_CHANNELS_SYNC, "reload").await;
        }
    }
}
