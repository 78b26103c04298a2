use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::{error, info};

use crate::config::CONFIG;
use crate::service::election;

// Per-channel used-quota increments awaiting a flush. Only this counter is
// coalesced; token and user balances are always written through so the next
// preconsume observes them.
static PENDING: Lazy<Mutex<HashMap<i64, i64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Coalesces a channel used-quota increment in memory; flushed later by the
/// flush loop.
pub fn record_channel_used_quota(channel_id: i64, increment: i64) {
    if increment == 0 {
        return;
    }
    let mut pending = PENDING.lock().unwrap();
    *pending.entry(channel_id).or_insert(0) += increment;
}

pub fn flush() {
    let drained: Vec<(i64, i64)> = {
        let mut pending = PENDING.lock().unwrap();
        pending.drain().collect()
    };
    if drained.is_empty() {
        return;
    }
    info!("flushing {} coalesced channel quota updates", drained.len());
    for (channel_id, increment) in drained {
        if let Err(e) = super::channel::apply_channel_used_quota(channel_id, increment) {
            error!("batch flush failed for channel {}: {}", channel_id, e);
        }
    }
}

/// Periodic flush task. Every node drains the increments it accumulated
/// itself; followers flush at a multiple of the interval so the leader
/// carries the steady write load.
pub fn start_batch_flush_loop() {
    if !CONFIG.batch_update_enabled {
        return;
    }
    let interval = Duration::from_secs(CONFIG.batch_update_interval.max(1));
    tokio::spawn(async move {
        info!("batch update flush loop started, interval={:?}", interval);
        let mut ticks: u64 = 0;
        loop {
            tokio::time::sleep(interval).await;
            ticks += 1;
            if !election::is_master() && ticks % 4 != 0 {
                continue;
            }
            if let Err(e) = tokio::task::spawn_blocking(flush).await {
                error!("batch flush task panicked: {}", e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_coalesces_increments() {
        {
            PENDING.lock().unwrap().clear();
        }
        record_channel_used_quota(7, 10);
        record_channel_used_quota(7, 5);
        record_channel_used_quota(9, 3);
        record_channel_used_quota(9, 0);

        let pending = PENDING.lock().unwrap();
        assert_eq!(pending.get(&7), Some(&15));
        assert_eq!(pending.get(&9), Some(&3));
        assert_eq!(pending.len(), 2);
    }
}
