use bb8::Pool;
use bb8_redis::{redis, RedisConnectionManager};
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::config::CONFIG;

pub type RedisPool = Pool<RedisConnectionManager>;

static POOL: OnceCell<Option<RedisPool>> = OnceCell::const_new();

async fn initialize_pool() -> Option<RedisPool> {
    let url = CONFIG.redis_url.as_ref()?;
    let manager = match RedisConnectionManager::new(url.as_str()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to create redis manager: {}", e);
            return None;
        }
    };
    let pool = match Pool::builder().max_size(16).build(manager).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("failed to create redis pool: {}", e);
            return None;
        }
    };

    // Test connection
    {
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("failed to get redis connection from pool for test: {}", e);
                return None;
            }
        };
        if let Err(e) = redis::cmd("PING").query_async::<()>(&mut *conn).await {
            error!("failed to ping redis: {}", e);
            return None;
        }
    }
    info!("redis connection pool initialized and tested successfully");
    Some(pool)
}

/// Returns a clone of the global Redis connection pool if Redis is configured.
pub async fn get_pool() -> Option<RedisPool> {
    POOL.get_or_init(initialize_pool).await.as_ref().cloned()
}

/// A dedicated client for blocking subscriber connections; the pooled
/// multiplexed connections cannot enter subscribe mode.
pub fn get_pubsub_client() -> Option<redis::Client> {
    let url = CONFIG.redis_url.as_ref()?;
    match redis::Client::open(url.as_str()) {
        Ok(client) => Some(client),
        Err(e) => {
            error!("failed to create redis pub/sub client: {}", e);
            None
        }
    }
}
