use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use once_cell::sync::Lazy;

pub mod sse;

// Millisecond timestamp shifted to leave room for a per-process sequence;
// unique enough for log rows from a handful of relay nodes.
static SEQUENCE: Lazy<AtomicI64> =
    Lazy::new(|| AtomicI64::new(Utc::now().timestamp_millis() << 16));

pub fn next_id() -> i64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id_monotonic() {
        let a = next_id();
        let b = next_id();
        assert!(b > a);
    }
}
