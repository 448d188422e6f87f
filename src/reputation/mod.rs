//! Reputation Engine (§4.5): weighted scoring driven by explicit events,
//! recomputed synchronously on every event so derived fields are never
//! stale (§9 — "reputation scoring re-computed on each event").

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ReputationConfig;

const ROLLING_UPTIME_SAMPLES: usize = 50;

#[derive(Debug, Clone, Copy)]
pub enum ReputationEvent {
    Connection { success: bool, response_time_ms: u64 },
    Verification { success: bool, response_time_ms: u64 },
    Transfer { count: u32, corrupted: u32 },
    Uptime { up: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    Trusted,
    Acceptable,
    Suspicious,
    Untrusted,
    Blacklisted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReputation {
    pub total_connections: u64,
    pub successful_connections: u64,
    pub total_challenges: u64,
    pub successful_challenges: u64,
    pub total_files: u64,
    pub corrupted_files: u64,
    #[serde(skip)]
    uptime_samples: VecDeque<bool>,
    pub average_response_time_ms: f64,
    response_time_samples: u64,
    pub data_integrity_score: f64,
    pub first_seen: u64,
    pub last_seen: u64,

    pub overall_score: f64,
    pub trust_level: TrustLevel,
    pub blacklisted: bool,
    pub blacklist_reason: Option<String>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl PeerReputation {
    fn new() -> Self {
        let now = now_secs();
        Self {
            total_connections: 0,
            successful_connections: 0,
            total_challenges: 0,
            successful_challenges: 0,
            total_files: 0,
            corrupted_files: 0,
            uptime_samples: VecDeque::with_capacity(ROLLING_UPTIME_SAMPLES),
            average_response_time_ms: 0.0,
            response_time_samples: 0,
            data_integrity_score: 1.0,
            first_seen: now,
            last_seen: now,
            overall_score: 0.5,
            trust_level: TrustLevel::Suspicious,
            blacklisted: false,
            blacklist_reason: None,
        }
    }

    fn record_response_time(&mut self, ms: u64) {
        let n = self.response_time_samples as f64;
        self.average_response_time_ms = (self.average_response_time_ms * n + ms as f64) / (n + 1.0);
        self.response_time_samples += 1;
    }

    fn connection_score(&self) -> f64 {
        if self.total_connections == 0 {
            0.5
        } else {
            self.successful_connections as f64 / self.total_connections as f64
        }
    }

    fn verification_score(&self) -> f64 {
        if self.total_challenges == 0 {
            0.5
        } else {
            self.successful_challenges as f64 / self.total_challenges as f64
        }
    }

    fn response_time_score(&self) -> f64 {
        (1.0 - self.average_response_time_ms / 30_000.0).max(0.0)
    }

    fn integrity_score(&self) -> f64 {
        if self.total_files == 0 {
            1.0
        } else {
            1.0 - self.corrupted_files as f64 / self.total_files as f64
        }
    }

    fn uptime_score(&self) -> f64 {
        if self.uptime_samples.is_empty() {
            0.5
        } else {
            let up = self.uptime_samples.iter().filter(|s| **s).count();
            up as f64 / self.uptime_samples.len() as f64
        }
    }

    /// Applies `event` and recomputes every derived field in the same
    /// call — never lazily (§9).
    fn apply_event(&mut self, event: ReputationEvent, config: &ReputationConfig) {
        self.last_seen = now_secs();
        match event {
            ReputationEvent::Connection { success, response_time_ms } => {
                self.total_connections += 1;
                if success {
                    self.successful_connections += 1;
                }
                self.record_response_time(response_time_ms);
            }
            ReputationEvent::Verification { success, response_time_ms } => {
                self.total_challenges += 1;
                if success {
                    self.successful_challenges += 1;
                }
                self.record_response_time(response_time_ms);
            }
            ReputationEvent::Transfer { count, corrupted } => {
                self.total_files += count as u64;
                self.corrupted_files += corrupted as u64;
            }
            ReputationEvent::Uptime { up } => {
                if self.uptime_samples.len() == ROLLING_UPTIME_SAMPLES {
                    self.uptime_samples.pop_front();
                }
                self.uptime_samples.push_back(up);
            }
        }
        self.data_integrity_score = self.integrity_score();
        self.recompute(config);
    }

    fn recompute(&mut self, config: &ReputationConfig) {
        let overall = 0.3 * self.uptime_score()
            + 0.2 * self.response_time_score()
            + 0.3 * self.verification_score()
            + 0.2 * self.integrity_score();

        if self.blacklisted {
            self.overall_score = 0.0;
            self.trust_level = TrustLevel::Blacklisted;
            return;
        }

        if overall < config.auto_blacklist_threshold {
            self.blacklisted = true;
            self.blacklist_reason = Some("automatic".to_string());
            self.overall_score = 0.0;
            self.trust_level = TrustLevel::Blacklisted;
            return;
        }

        self.overall_score = overall;
        self.trust_level = if overall >= config.trusted_threshold {
            TrustLevel::Trusted
        } else if overall >= config.acceptable_threshold {
            TrustLevel::Acceptable
        } else if overall >= config.suspicious_threshold {
            TrustLevel::Suspicious
        } else {
            TrustLevel::Untrusted
        };
    }

    pub fn acceptable(&self, min: f64) -> bool {
        !self.blacklisted && self.overall_score >= min
    }

    /// Merge-import rule (§4.5): max of last-seen, sum of counters, more
    /// restrictive blacklist flag.
    fn merge(&mut self, other: &PeerReputation, config: &ReputationConfig) {
        self.total_connections += other.total_connections;
        self.successful_connections += other.successful_connections;
        self.total_challenges += other.total_challenges;
        self.successful_challenges += other.successful_challenges;
        self.total_files += other.total_files;
        self.corrupted_files += other.corrupted_files;
        self.last_seen = self.last_seen.max(other.last_seen);
        self.first_seen = self.first_seen.min(other.first_seen);
        if other.blacklisted {
            self.blacklisted = true;
            self.blacklist_reason = other.blacklist_reason.clone();
        }
        self.recompute(config);
    }
}

pub struct ReputationEngine {
    config: ReputationConfig,
    records: parking_lot::Mutex<HashMap<String, PeerReputation>>,
    dirty_events: std::sync::atomic::AtomicU32,
}

impl ReputationEngine {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            records: parking_lot::Mutex::new(HashMap::new()),
            dirty_events: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn record(&self, peer_id_hash: &str, event: ReputationEvent) {
        let mut records = self.records.lock();
        let record = records
            .entry(peer_id_hash.to_string())
            .or_insert_with(PeerReputation::new);
        record.apply_event(event, &self.config);
        drop(records);

        use std::sync::atomic::Ordering;
        self.dirty_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether a flush should happen now (every 10 connection events, per
    /// §4.5). The caller performs the actual persistence.
    pub fn should_flush(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.dirty_events.load(Ordering::Relaxed) >= self.config.flush_every_n_events
    }

    pub fn mark_flushed(&self) {
        use std::sync::atomic::Ordering;
        self.dirty_events.store(0, Ordering::Relaxed);
    }

    pub fn get(&self, peer_id_hash: &str) -> Option<PeerReputation> {
        self.records.lock().get(peer_id_hash).cloned()
    }

    pub fn acceptable(&self, peer_id_hash: &str, min: f64) -> bool {
        self.records
            .lock()
            .get(peer_id_hash)
            .map(|r| r.acceptable(min))
            .unwrap_or(true)
    }

    pub fn merge(&self, peer_id_hash: &str, other: PeerReputation) {
        let mut records = self.records.lock();
        let record = records
            .entry(peer_id_hash.to_string())
            .or_insert_with(PeerReputation::new);
        record.merge(&other, &self.config);
    }

    /// Persist every tracked peer's reputation to the `peers` table
    /// (§4.5 auto-flush). Individual row failures are logged and skipped
    /// rather than aborting the whole flush.
    pub fn flush(&self, store: &crate::store::Store) -> crate::error::Result<()> {
        let records = self.records.lock().clone();
        for (peer_id_hash, record) in records.iter() {
            let metadata_json = serde_json::to_string(record)?;
            if let Err(e) = store.upsert_peer_reputation(
                peer_id_hash,
                trust_level_str(record.trust_level),
                record.last_seen,
                &metadata_json,
            ) {
                tracing::warn!(peer = %peer_id_hash, error = %e, "failed to flush reputation record");
            }
        }
        self.mark_flushed();
        Ok(())
    }
}

pub fn trust_level_str(level: TrustLevel) -> &'static str {
    match level {
        TrustLevel::Trusted => "trusted",
        TrustLevel::Acceptable => "acceptable",
        TrustLevel::Suspicious => "suspicious",
        TrustLevel::Untrusted => "untrusted",
        TrustLevel::Blacklisted => "blacklisted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ReputationEngine {
        ReputationEngine::new(ReputationConfig::default())
    }

    #[test]
    fn successful_counters_never_exceed_totals() {
        let engine = engine();
        for i in 0..5 {
            engine.record(
                "peer1",
                ReputationEvent::Connection {
                    success: i % 2 == 0,
                    response_time_ms: 100,
                },
            );
        }
        let record = engine.get("peer1").unwrap();
        assert!(record.successful_connections <= record.total_connections);
    }

    #[test]
    fn score_below_auto_blacklist_threshold_blacklists() {
        let engine = engine();
        for _ in 0..20 {
            engine.record(
                "peer1",
                ReputationEvent::Verification { success: false, response_time_ms: 29_000 },
            );
            engine.record("peer1", ReputationEvent::Transfer { count: 10, corrupted: 10 });
            engine.record("peer1", ReputationEvent::Uptime { up: false });
        }
        let record = engine.get("peer1").unwrap();
        assert!(record.blacklisted);
        assert_eq!(record.trust_level, TrustLevel::Blacklisted);
        assert_eq!(record.overall_score, 0.0);
    }

    #[test]
    fn acceptable_predicate_rejects_blacklisted_regardless_of_min() {
        let engine = engine();
        for _ in 0..20 {
            engine.record("peer1", ReputationEvent::Uptime { up: false });
            engine.record("peer1", ReputationEvent::Verification { success: false, response_time_ms: 30_000 });
        }
        assert!(!engine.acceptable("peer1", 0.0));
    }

    #[test]
    fn flush_counter_fires_after_ten_events() {
        let engine = engine();
        for _ in 0..10 {
            engine.record("peer1", ReputationEvent::Connection { success: true, response_time_ms: 10 });
        }
        assert!(engine.should_flush());
        engine.mark_flushed();
        assert!(!engine.should_flush());
    }
}
