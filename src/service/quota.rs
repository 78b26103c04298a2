use bb8_redis::redis::AsyncCommands;
use thiserror::Error;
use tracing::warn;

use crate::database::{token, user, DbError};
use crate::service::redis::get_pool;

const USER_QUOTA_KEY_PREFIX: &str = "relay:user_quota:";
const USER_QUOTA_TTL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("{0}")]
    PreConsumeFailed(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

fn user_quota_key(user_id: i64) -> String {
    format!("{}{}", USER_QUOTA_KEY_PREFIX, user_id)
}

/// Read-through cached view of a user's quota. Redis misses (or Redis being
/// off) fall back to the database and repopulate the cache.
pub async fn cache_get_user_quota(user_id: i64) -> Result<i64, QuotaError> {
    if let Some(pool) = get_pool().await {
        if let Ok(mut conn) = pool.get().await {
            let cached: Result<Option<i64>, _> = conn.get(user_quota_key(user_id)).await;
            if let Ok(Some(quota)) = cached {
                return Ok(quota);
            }
            let quota = user::get_user_quota(user_id)?;
            if let Err(e) = conn
                .set_ex::<_, _, ()>(user_quota_key(user_id), quota, USER_QUOTA_TTL_SECS)
                .await
            {
                warn!("failed to cache user {} quota: {}", user_id, e);
            }
            return Ok(quota);
        }
    }
    Ok(user::get_user_quota(user_id)?)
}

/// Best-effort decrement of the cached value; the persisted state is only
/// touched at settlement. A missing key is left missing so the next read
/// repopulates from the database.
pub async fn cache_decrease_user_quota(user_id: i64, amount: i64) {
    if amount == 0 {
        return;
    }
    let Some(pool) = get_pool().await else {
        return;
    };
    let Ok(mut conn) = pool.get().await else {
        return;
    };
    let exists: Result<bool, _> = conn.exists(user_quota_key(user_id)).await;
    if let Ok(true) = exists {
        if let Err(e) = conn.decr::<_, _, ()>(user_quota_key(user_id), amount).await {
            warn!("failed to decrease cached quota for user {}: {}", user_id, e);
        }
    }
}

/// Write-through refresh after settlement so the next preconsume observes
/// the persisted balance.
pub async fn cache_update_user_quota(user_id: i64) -> Result<(), QuotaError> {
    let quota = user::get_user_quota(user_id)?;
    if let Some(pool) = get_pool().await {
        if let Ok(mut conn) = pool.get().await {
            if let Err(e) = conn
                .set_ex::<_, _, ()>(user_quota_key(user_id), quota, USER_QUOTA_TTL_SECS)
                .await
            {
                warn!("failed to refresh cached quota for user {}: {}", user_id, e);
            }
        }
    }
    Ok(())
}

/// Tentative deduction before dispatch; the token row linearizes concurrent
/// preconsumers.
pub fn pre_consume_token_quota(token_id: i64, quota: i64) -> Result<(), QuotaError> {
    token::pre_consume_token_quota(token_id, quota)
        .map_err(|e| QuotaError::PreConsumeFailed(e.to_string()))
}

/// Applies a settlement delta to both the token's persisted remaining quota
/// and the user's persisted balance; a negative delta refunds. The refund of
/// a failed call is this same path with usage settled at zero.
pub fn post_consume_token_quota(token_id: i64, user_id: i64, delta: i64) -> Result<(), QuotaError> {
    token::post_consume_token_quota(token_id, delta)?;
    user::decrease_user_quota(user_id, delta)?;
    Ok(())
}
