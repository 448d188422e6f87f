//! Rate Limiter (§4.3): dual sliding-window + per-message-type admission
//! control keyed by peer-id-hash, with temporary bans on sustained abuse.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Burst,
    Window,
    MessageType,
    Banned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Blocked(RejectReason),
}

struct SlidingWindow {
    events: VecDeque<Instant>,
    window: Duration,
    max: u32,
}

impl SlidingWindow {
    fn new(window: Duration, max: u32) -> Self {
        Self {
            events: VecDeque::new(),
            window,
            max,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn utilization(&self, now: Instant) -> f64 {
        let mut count = 0usize;
        for e in self.events.iter().rev() {
            if now.duration_since(*e) <= self.window {
                count += 1;
            } else {
                break;
            }
        }
        count as f64 / self.max as f64
    }

    /// Returns true if admitted; does not mutate on rejection.
    fn try_admit(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.events.len() as u32 >= self.max {
            return false;
        }
        self.events.push_back(now);
        true
    }
}

struct PeerState {
    coarse: SlidingWindow,
    burst: SlidingWindow,
    per_type: DashMap<String, SlidingWindow>,
    banned_until: Option<Instant>,
}

fn message_type_cap(kind: &str) -> Option<u32> {
    match kind {
        "file_chunk" => Some(200),
        "ping" => Some(60),
        "storage_challenge" => Some(10),
        "peer_identity" => Some(5),
        "file_start" => Some(20),
        _ => None,
    }
}

pub struct RateLimitStats {
    pub coarse_utilization: f64,
    pub burst_utilization: f64,
    pub banned: bool,
}

/// Config + Manager shape, grounded on the teacher's `RateLimitConfig` /
/// `RateLimiter` split, re-keyed by peer-id-hash instead of `IpAddr` and
/// extended with per-message-type caps.
pub struct RateLimiter {
    config: RateLimitConfig,
    peers: DashMap<String, PeerState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
        }
    }

    fn new_peer_state(&self) -> PeerState {
        PeerState {
            coarse: SlidingWindow::new(self.config.coarse_window, self.config.coarse_max),
            burst: SlidingWindow::new(self.config.burst_window, self.config.burst_max),
            per_type: DashMap::new(),
            banned_until: None,
        }
    }

    /// Admission check for an inbound message of `kind` from `peer_id_hash`.
    /// Per §4.3, rejection does not mutate counters for that request.
    pub fn check(&self, peer_id_hash: &str, kind: &str) -> RateLimitResult {
        let now = Instant::now();
        let mut entry = self
            .peers
            .entry(peer_id_hash.to_string())
            .or_insert_with(|| self.new_peer_state());

        if let Some(until) = entry.banned_until {
            if now < until {
                return RateLimitResult::Blocked(RejectReason::Banned);
            }
            entry.banned_until = None;
        }

        if !entry.burst.clone_admit_check(now) {
            return RateLimitResult::Blocked(RejectReason::Burst);
        }

        if let Some(cap) = message_type_cap(kind) {
            let mut window = entry
                .per_type
                .entry(kind.to_string())
                .or_insert_with(|| SlidingWindow::new(self.config.coarse_window, cap));
            if !window.value().clone_admit_check(now) {
                return RateLimitResult::Blocked(RejectReason::MessageType);
            }
        } else if !entry.coarse.clone_admit_check(now) {
            return RateLimitResult::Blocked(RejectReason::Window);
        }

        // Admitted: mutate all the counters that gate this kind.
        entry.burst.try_admit(now);
        if let Some(cap) = message_type_cap(kind) {
            let mut window = entry
                .per_type
                .entry(kind.to_string())
                .or_insert_with(|| SlidingWindow::new(self.config.coarse_window, cap));
            window.value_mut().try_admit(now);
        } else {
            entry.coarse.try_admit(now);
        }

        self.maybe_ban(&mut entry, now);
        RateLimitResult::Allowed
    }

    fn maybe_ban(&self, entry: &mut PeerState, now: Instant) {
        let coarse_util = entry.coarse.utilization(now);
        let burst_util = entry.burst.utilization(now);
        if coarse_util > self.config.coarse_ban_threshold || burst_util > self.config.burst_ban_threshold {
            entry.banned_until = Some(now + self.config.ban_duration);
        }
    }

    pub fn stats(&self, peer_id_hash: &str) -> Option<RateLimitStats> {
        let now = Instant::now();
        self.peers.get(peer_id_hash).map(|entry| RateLimitStats {
            coarse_utilization: entry.coarse.utilization(now),
            burst_utilization: entry.burst.utilization(now),
            banned: entry.banned_until.map(|u| now < u).unwrap_or(false),
        })
    }

    /// Garbage-collect stale per-peer records every half-window (§4.3).
    pub fn gc(&self) {
        let now = Instant::now();
        self.peers.retain(|_, state| {
            let has_recent = !state.coarse.events.is_empty() || !state.burst.events.is_empty();
            let is_banned = state.banned_until.map(|u| now < u).unwrap_or(false);
            has_recent || is_banned
        });
    }
}

impl SlidingWindow {
    /// Non-mutating admission check used to decide rejection before any
    /// counters for this request are touched.
    fn clone_admit_check(&self, now: Instant) -> bool {
        let mut count = 0usize;
        for e in self.events.iter() {
            if now.duration_since(*e) <= self.window {
                count += 1;
            }
        }
        (count as u32) < self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            coarse_window: StdDuration::from_secs(60),
            coarse_max: 100,
            burst_window: StdDuration::from_secs(1),
            burst_max: 20,
            ban_duration: StdDuration::from_secs(300),
            coarse_ban_threshold: 0.90,
            burst_ban_threshold: 0.95,
        })
    }

    #[test]
    fn exactly_max_allowed_then_one_more_denied() {
        let rl = limiter();
        for _ in 0..20 {
            assert_eq!(rl.check("peerhash0000000a", "ping"), RateLimitResult::Allowed);
        }
        // ping has its own type cap of 60 > burst cap of 20, so burst trips first.
        assert_eq!(
            rl.check("peerhash0000000a", "ping"),
            RateLimitResult::Blocked(RejectReason::Burst)
        );
    }

    #[test]
    fn message_type_cap_is_enforced_independently() {
        let rl = limiter();
        // storage_challenge cap is 10, below the burst cap of 20.
        for _ in 0..10 {
            assert_eq!(
                rl.check("peerhash0000000b", "storage_challenge"),
                RateLimitResult::Allowed
            );
        }
        assert_eq!(
            rl.check("peerhash0000000b", "storage_challenge"),
            RateLimitResult::Blocked(RejectReason::MessageType)
        );
    }

    #[test]
    fn ban_blocks_all_subsequent_messages() {
        let rl = limiter();
        for _ in 0..25 {
            rl.check("peerhash0000000c", "file_chunk");
        }
        let stats = rl.stats("peerhash0000000c").unwrap();
        assert!(stats.banned);
        assert_eq!(
            rl.check("peerhash0000000c", "ping"),
            RateLimitResult::Blocked(RejectReason::Banned)
        );
    }
}
