use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bb8_redis::redis::Script;
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::{make_node_id, CONFIG};
use crate::service::redis::get_pool;

const LEADER_KEY: &str = "relay:leader";

// Lua script: renew TTL only if we still own the lock (value matches)
const RENEW_LUA: &str = r#"
local v = redis.call('GET', KEYS[1])
if v == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Current role of this node. Written only by the election loop (or once at
/// startup when election is disabled); read concurrently by workers.
static IS_MASTER: AtomicBool = AtomicBool::new(false);

pub fn is_master() -> bool {
    IS_MASTER.load(Ordering::Relaxed)
}

fn set_master(value: bool) {
    IS_MASTER.store(value, Ordering::Relaxed);
}

/// Spawns the background election task:
/// - competes for a Redis SETNX lease to become leader
/// - renews the lease while holding it
/// - demotes to follower when the lease cannot be renewed
///
/// If Redis is not configured, or `leader_election.enable` is explicitly
/// false, the loop never starts and the static `is_master_node` config
/// controls the role.
pub async fn start_leader_election() {
    if !CONFIG.redis_enabled() {
        set_master(CONFIG.is_master_node);
        return;
    }
    if CONFIG.leader_election_enable == Some(false) {
        info!("leader election disabled by config: leader_election.enable=false");
        set_master(CONFIG.is_master_node);
        return;
    }
    let Some(pool) = get_pool().await else {
        // Redis said enabled but the pool never came up
        error!("leader election skipped: redis pool not initialized");
        set_master(CONFIG.is_master_node);
        return;
    };

    let lease_seconds = if CONFIG.leader_election_lease_seconds == 0 {
        15
    } else {
        CONFIG.leader_election_lease_seconds
    };
    let lease_ttl = Duration::from_secs(lease_seconds);
    // Renew at half the TTL (but no less than 1s)
    let renew_interval = (lease_ttl / 2).max(Duration::from_secs(1));

    let node_id = make_node_id();
    let renew_script = Script::new(RENEW_LUA);

    tokio::spawn(async move {
        let mut is_leader = false;
        let mut last_state_logged: Option<Instant> = None;

        info!(
            "leader election started, node={}, lease={}s, renew={:?}",
            node_id, lease_seconds, renew_interval
        );

        // Avoid log spam: at most once every 30s unless state flips
        let mut log_state = move |msg: &str| {
            let stale = last_state_logged
                .map(|t| t.elapsed() >= Duration::from_secs(30))
                .unwrap_or(true);
            if stale {
                info!("{}", msg);
                last_state_logged = Some(Instant::now());
            }
        };

        loop {
            let mut conn = match pool.get().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("leader election connection error (node={}): {}", node_id, e);
                    if is_leader || is_master() {
                        info!("leadership uncertain, demoting to follower, node={}", node_id);
                    }
                    is_leader = false;
                    set_master(false);
                    tokio::time::sleep(renew_interval).await;
                    continue;
                }
            };

            if !is_leader {
                // Try to acquire leadership
                let acquired = bb8_redis::redis::cmd("SET")
                    .arg(LEADER_KEY)
                    .arg(&node_id)
                    .arg("NX")
                    .arg("PX")
                    .arg(lease_ttl.as_millis() as u64)
                    .query_async::<Option<String>>(&mut *conn)
                    .await;
                match acquired {
                    Ok(Some(_)) => {
                        if !is_master() {
                            info!("leadership acquired, node={}", node_id);
                        }
                        set_master(true);
                        is_leader = true;
                    }
                    Ok(None) => {
                        if is_master() {
                            info!("leadership lost (another node holds the lease), node={}", node_id);
                        }
                        set_master(false);
                        log_state(&format!(
                            "follower state, waiting to acquire leadership, node={}",
                            node_id
                        ));
                    }
                    Err(e) => {
                        error!("leader election SET NX error (node={}): {}", node_id, e);
                        set_master(false);
                    }
                }
                tokio::time::sleep(renew_interval).await;
                continue;
            }

            // Renew the lease if we still own it.
            // ARGV[1]=node_id, ARGV[2]=ttl_millis
            let renewed = renew_script
                .key(LEADER_KEY)
                .arg(&node_id)
                .arg(lease_ttl.as_millis() as u64)
                .invoke_async::<i64>(&mut *conn)
                .await;
            match renewed {
                Ok(1) => {
                    log_state(&format!("leader state, lease renewed, node={}", node_id));
                }
                Ok(_) => {
                    // Renew failed; demote
                    is_leader = false;
                    if is_master() {
                        info!("leadership renewal failed, demoting to follower, node={}", node_id);
                    }
                    set_master(false);
                }
                Err(e) => {
                    error!("leader renew error (node={}): {}", node_id, e);
                    is_leader = false;
                    if is_master() {
                        info!(
                            "leadership renewal returned unexpected result, demoting to follower, node={}",
                            node_id
                        );
                    }
                    set_master(false);
                }
            }

            tokio::time::sleep(renew_interval).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_flag_round_trip() {
        set_master(true);
        assert!(is_master());
        set_master(false);
        assert!(!is_master());
    }

    #[test]
    fn test_renew_script_guards_on_owner() {
        // The Lua source must compare before extending; a node that lost the
        // lease must see 0 and never revive the key.
        assert!(RENEW_LUA.contains("GET"));
        assert!(RENEW_LUA.contains("PEXPIRE"));
        assert!(RENEW_LUA.contains("return 0"));
    }
}
