use std::time::Duration;

use bb8_redis::redis::AsyncCommands;
use futures::StreamExt;
use tracing::{error, info, warn};

use crate::config::CONFIG;
use crate::database::{ability, channel};
use crate::service::ratio;
use crate::service::redis::{get_pool, get_pubsub_client};

pub const TOPIC_OPTIONS_SYNC: &str = "options_sync";
pub const TOPIC_CHANNELS_SYNC: &str = "channels_sync";

/// Starts the Redis pub/sub listeners that refresh in-memory state
/// immediately when a peer mutates configuration. Also performs a staggered
/// warm-up load so a freshly booted node does not serve cold state.
pub async fn start_realtime_sync() {
    if !CONFIG.redis_enabled() {
        return;
    }
    let Some(client) = get_pubsub_client() else {
        error!("realtime sync skipped: redis client not initialized");
        return;
    };

    tokio::spawn(async move {
        // Small stagger to avoid thundering herd during simultaneous boots
        tokio::time::sleep(Duration::from_millis(500)).await;
        safe_reload_options().await;
        safe_reload_channels().await;
    });

    tokio::spawn(async move {
        info!("realtime sync subscriber started (redis pub/sub)");
        loop {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    error!("realtime sync subscribe error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let subscribed = pubsub.subscribe(TOPIC_OPTIONS_SYNC).await.and(
                pubsub.subscribe(TOPIC_CHANNELS_SYNC).await,
            );
            if let Err(e) = subscribed {
                error!("realtime sync subscribe error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let topic = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("realtime sync payload decode error: {}", e);
                        continue;
                    }
                };
                // Any accepted payload means a full reload; the payload text
                // itself is advisory.
                if accept_payload(&payload, &CONFIG.instance_id).is_none() {
                    continue;
                }

                match topic.as_str() {
                    TOPIC_OPTIONS_SYNC => safe_reload_options().await,
                    TOPIC_CHANNELS_SYNC => safe_reload_channels().await,
                    _ => {}
                }
            }
            warn!("realtime sync stream closed, resubscribing");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

/// Extracts the payload behind the origin tag, or None when the message was
/// published by this very node (self-origin suppression).
fn accept_payload<'a>(raw: &'a str, own_instance_id: &str) -> Option<&'a str> {
    if let Some(sep) = raw.find('|') {
        if sep > 0 {
            let origin = &raw[..sep];
            if origin == own_instance_id {
                return None;
            }
            return Some(&raw[sep + 1..]);
        }
    }
    Some(raw)
}

/// Publishes a sync message tagged with this node's instance id so peers
/// reload without re-publishing to themselves.
pub async fn publish(topic: &str, payload: &str) {
    let Some(pool) = get_pool().await else {
        return;
    };
    let message = format!("{}|{}", CONFIG.instance_id, payload);
    let conn_result = pool.get().await;
    match conn_result {
        Ok(mut conn) => {
            if let Err(e) = conn.publish::<_, _, ()>(topic, message).await {
                error!("failed to publish on {}: {}", topic, e);
            }
        }
        Err(e) => error!("failed to get redis connection for publish: {}", e),
    }
}

// A crash inside a reload must not kill the subscriber loop; the blocking
// task boundary catches the panic and we log and move on.
async fn safe_reload_options() {
    let result = tokio::task::spawn_blocking(ratio::reload_options).await;
    match result {
        Ok(Err(e)) => error!("options reload failed: {}", e),
        Err(e) => error!("panic reloading options: {}", e),
        Ok(Ok(())) => {}
    }
}

async fn safe_reload_channels() {
    let result = tokio::task::spawn_blocking(|| {
        ability::rebuild_all_abilities()?;
        // Keep the pricing table in sync with the fresh channel index.
        ratio::reload_options()
    })
    .await;
    match result {
        Ok(Err(e)) => error!("channels reload failed: {}", e),
        Err(e) => error!("panic reloading channels: {}", e),
        Ok(Ok(())) => {}
    }
    channel::invalidate_enabled_channels_cache().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_origin_suppressed() {
        assert_eq!(accept_payload("node-a|reload", "node-a"), None);
    }

    #[test]
    fn test_foreign_origin_accepted() {
        assert_eq!(accept_payload("node-b|reload", "node-a"), Some("reload"));
    }

    #[test]
    fn test_untagged_payload_accepted() {
        assert_eq!(accept_payload("reload", "node-a"), Some("reload"));
    }

    #[test]
    fn test_leading_separator_is_not_a_tag() {
        assert_eq!(accept_payload("|reload", "node-a"), Some("|reload"));
    }
}
