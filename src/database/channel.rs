use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::{ability, batch, get_connection, DbResult};
use crate::config::CONFIG;
use crate::db_execute;
use crate::schema::channels;
use crate::service::redis::get_pool;
use bb8_redis::redis::AsyncCommands;

pub const CHANNEL_STATUS_ENABLED: i32 = 1;
pub const CHANNEL_STATUS_MANUALLY_DISABLED: i32 = 2;
pub const CHANNEL_STATUS_AUTO_DISABLED: i32 = 3;

const ENABLED_CHANNELS_KEY: &str = "channel:enable:list";
const ENABLED_CHANNELS_LOCK_KEY: &str = "channel:enable:list:lock";
const ENABLED_CHANNELS_TTL_SECS: u64 = 150;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = channels)]
pub struct Channel {
    pub id: i64,
    pub channel_type: i32,
    pub channel_key: String,
    pub name: String,
    pub status: i32,
    pub weight: i64,
    pub priority: i64,
    pub async_num: i32,
    pub base_url: String,
    pub full_url: String,
    pub other: String,
    pub models: String,
    pub channel_group: String,
    pub model_mapping: String,
    pub used_quota: i64,
    pub created_time: i64,
    pub test_time: i64,
    pub response_time: i32,
}

pub fn get_channel_by_id(id: i64) -> DbResult<Channel> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        let channel = channels::table
            .find(id)
            .select(Channel::as_select())
            .first::<Channel>(conn)?;
        Ok(channel)
    })
}

fn read_channels_from_db() -> DbResult<Vec<Channel>> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        let list = channels::table
            .filter(channels::status.eq(CHANNEL_STATUS_ENABLED))
            .select(Channel::as_select())
            .load::<Channel>(conn)?;
        Ok(list)
    })
}

/// Enabled channels, served from the Redis list cache when possible. The
/// refresh runs under a short SETNX lock to avoid a reload stampede; any
/// lock or cache failure falls back to a direct database read, so a stale
/// or missing cache never blocks relaying.
pub async fn get_enabled_channels() -> DbResult<Vec<Channel>> {
    let Some(pool) = get_pool().await else {
        return read_channels_from_db();
    };
    let mut conn = match pool.get().await {
        Ok(conn) => conn,
        Err(_) => return read_channels_from_db(),
    };

    let lock = bb8_redis::redis::cmd("SET")
        .arg(ENABLED_CHANNELS_LOCK_KEY)
        .arg("1")
        .arg("NX")
        .arg("EX")
        .arg(5u64)
        .query_async::<Option<String>>(&mut *conn)
        .await;
    let locked = match lock {
        Ok(reply) => reply.is_some(),
        Err(_) => return read_channels_from_db(),
    };
    if !locked {
        return read_channels_from_db();
    }

    let result = load_channels_with_cache(&mut *conn).await;

    if let Err(e) = conn.del::<_, ()>(ENABLED_CHANNELS_LOCK_KEY).await {
        warn!("failed to release channel list lock: {}", e);
    }
    result
}

async fn load_channels_with_cache(
    conn: &mut bb8_redis::redis::aio::MultiplexedConnection,
) -> DbResult<Vec<Channel>> {
    let cached: Vec<String> = conn
        .lrange(ENABLED_CHANNELS_KEY, 0, -1)
        .await
        .unwrap_or_default();
    if !cached.is_empty() {
        let channels: Vec<Channel> = cached
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();
        if !channels.is_empty() {
            return Ok(channels);
        }
    }

    // Cache miss: load from the database and repopulate the list.
    let channels = read_channels_from_db()?;
    for channel in &channels {
        match serde_json::to_string(channel) {
            Ok(raw) => {
                if let Err(e) = conn.lpush::<_, _, ()>(ENABLED_CHANNELS_KEY, raw).await {
                    warn!("failed to cache channel {}: {}", channel.id, e);
                }
            }
            Err(e) => warn!("failed to serialize channel {}: {}", channel.id, e),
        }
    }
    if let Err(e) = conn
        .expire::<_, ()>(ENABLED_CHANNELS_KEY, ENABLED_CHANNELS_TTL_SECS as i64)
        .await
    {
        warn!("failed to set channel list ttl: {}", e);
    }
    Ok(channels)
}

pub async fn invalidate_enabled_channels_cache() {
    if let Some(pool) = get_pool().await {
        if let Ok(mut conn) = pool.get().await {
            let _: Result<(), _> = conn.del(ENABLED_CHANNELS_KEY).await;
        }
    }
}

pub fn update_channel_used_quota(channel_id: i64, quota: i64) {
    if CONFIG.batch_update_enabled {
        batch::record_channel_used_quota(channel_id, quota);
        return;
    }
    if let Err(e) = apply_channel_used_quota(channel_id, quota) {
        error!("failed to update channel {} used quota: {}", channel_id, e);
    }
}

pub(super) fn apply_channel_used_quota(channel_id: i64, quota: i64) -> DbResult<()> {
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        diesel::update(channels::table.find(channel_id))
            .set(channels::used_quota.eq(channels::used_quota + quota))
            .execute(conn)?;
        Ok(())
    })
}

pub fn update_channel_response_time(channel_id: i64, response_time_ms: i64) {
    let result = (|| -> DbResult<()> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(channels::table.find(channel_id))
                .set((
                    channels::test_time.eq(Utc::now().timestamp()),
                    channels::response_time.eq(response_time_ms as i32),
                ))
                .execute(conn)?;
            Ok(())
        })
    })();
    if let Err(e) = result {
        error!("failed to update channel {} response time: {}", channel_id, e);
    }
}

/// Status changes also flip the derived ability rows so selection stops
/// (or resumes) immediately, before any cache refresh.
pub fn update_channel_status(channel_id: i64, status: i32) -> DbResult<()> {
    ability::update_ability_status(channel_id, status == CHANNEL_STATUS_ENABLED)?;
    let conn = &mut get_connection()?;
    db_execute!(conn, {
        diesel::update(channels::table.find(channel_id))
            .set(channels::status.eq(status))
            .execute(conn)?;
        Ok(())
    })
}
