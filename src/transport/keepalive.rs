//! Keepalive and reconnect policy (§4.6): a signed ping every 30 s while
//! connected; a missing ack for two intervals triggers disconnect; up to
//! 5 reconnect attempts with exponential backoff (base 1 s, doubling),
//! preferring cached-session resumption for peers seen within the last
//! hour.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const MISSED_ACKS_BEFORE_DISCONNECT: u32 = 2;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const CACHED_SESSION_FRESHNESS: Duration = Duration::from_secs(3600);

/// Exponential backoff for reconnect attempt `attempt` (0-indexed),
/// doubling from a 1 s base.
pub fn reconnect_backoff(attempt: u32) -> Duration {
    RECONNECT_BASE_DELAY.saturating_mul(1u32 << attempt.min(16))
}

pub fn reconnect_attempts_exhausted(attempt: u32) -> bool {
    attempt >= MAX_RECONNECT_ATTEMPTS
}

/// Whether a cached peer connection last seen at `last_seen_secs` is
/// fresh enough to prefer resumption over falling back to signaling.
pub fn cached_session_is_fresh(last_seen_secs: u64) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now.saturating_sub(last_seen_secs) <= CACHED_SESSION_FRESHNESS.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_second() {
        assert_eq!(reconnect_backoff(0), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(1), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(4), Duration::from_secs(16));
    }

    #[test]
    fn five_attempts_is_the_cap() {
        assert!(!reconnect_attempts_exhausted(4));
        assert!(reconnect_attempts_exhausted(5));
    }

    #[test]
    fn a_peer_seen_thirty_minutes_ago_is_fresh() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(cached_session_is_fresh(now - 1800));
        assert!(!cached_session_is_fresh(now - 7200));
    }
}
