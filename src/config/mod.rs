//! Process configuration, loaded once at startup from environment
//! variables (§6, expansion). Construction is pure: no network call or
//! file access happens while building a `Config`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub listen_port: u16,
    pub signaling_url: String,
    pub chunk_size: usize,
    pub max_offered_global: u64,
    pub challenge_cadence: Duration,
    pub keepalive_interval: Duration,
    pub log_level: String,

    pub rate_limit: RateLimitConfig,
    pub reputation: ReputationConfig,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub coarse_window: Duration,
    pub coarse_max: u32,
    pub burst_window: Duration,
    pub burst_max: u32,
    pub ban_duration: Duration,
    pub coarse_ban_threshold: f64,
    pub burst_ban_threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            coarse_window: Duration::from_secs(60),
            coarse_max: 100,
            burst_window: Duration::from_secs(1),
            burst_max: 20,
            ban_duration: Duration::from_secs(300),
            coarse_ban_threshold: 0.90,
            burst_ban_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReputationConfig {
    pub trusted_threshold: f64,
    pub acceptable_threshold: f64,
    pub suspicious_threshold: f64,
    pub auto_blacklist_threshold: f64,
    pub flush_every_n_events: u32,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            trusted_threshold: 0.8,
            acceptable_threshold: 0.6,
            suspicious_threshold: 0.4,
            auto_blacklist_threshold: 0.2,
            flush_every_n_events: 10,
        }
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".backup-peer")
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables (§6). There is no
    /// compiled-in default signaling URL (§9 Open Questions resolution):
    /// a first run without `BACKUP_PEER_SIGNALING_URL` set fails here
    /// rather than silently choosing between a local and production
    /// broker.
    pub fn from_env() -> Result<Self> {
        let home = std::env::var("BACKUP_PEER_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home());

        let signaling_url = std::env::var("BACKUP_PEER_SIGNALING_URL").map_err(|_| {
            Error::Config(
                "BACKUP_PEER_SIGNALING_URL must be set; no default broker is assumed".into(),
            )
        })?;

        let listen_port: u16 = env_or("BACKUP_PEER_LISTEN_PORT", "0")
            .parse()
            .map_err(|_| Error::Config("BACKUP_PEER_LISTEN_PORT must be a u16".into()))?;

        let chunk_size: usize = env_or("BACKUP_PEER_CHUNK_SIZE", "65536")
            .parse()
            .map_err(|_| Error::Config("BACKUP_PEER_CHUNK_SIZE must be a positive integer".into()))?;

        let max_offered_global: u64 = env_or(
            "BACKUP_PEER_MAX_OFFERED_GLOBAL",
            &(1u64 << 40).to_string(),
        )
        .parse()
        .map_err(|_| Error::Config("BACKUP_PEER_MAX_OFFERED_GLOBAL must be a u64".into()))?;

        let challenge_cadence_secs: u64 = env_or("BACKUP_PEER_CHALLENGE_CADENCE_SECS", "86400")
            .parse()
            .map_err(|_| Error::Config("BACKUP_PEER_CHALLENGE_CADENCE_SECS must be a u64".into()))?;

        let keepalive_secs: u64 = env_or("BACKUP_PEER_KEEPALIVE_SECS", "30")
            .parse()
            .map_err(|_| Error::Config("BACKUP_PEER_KEEPALIVE_SECS must be a u64".into()))?;

        let log_level = env_or("BACKUP_PEER_LOG_LEVEL", "info");

        let config = Self {
            home,
            listen_port,
            signaling_url,
            chunk_size,
            max_offered_global,
            challenge_cadence: Duration::from_secs(challenge_cadence_secs),
            keepalive_interval: Duration::from_secs(keepalive_secs),
            log_level,
            rate_limit: RateLimitConfig::default(),
            reputation: ReputationConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }
        if self.signaling_url.is_empty() {
            return Err(Error::Config("signaling_url must not be empty".into()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("backuppeer.db")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.home.join("keys")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.home.join("backups")
    }

    pub fn received_dir(&self) -> PathBuf {
        self.home.join("received")
    }

    pub fn received_chunks_dir(&self) -> PathBuf {
        self.home.join("received").join("chunks")
    }

    pub fn allocation_snapshot_path(&self) -> PathBuf {
        self.home.join("allocation.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_signaling_url_fails_validation() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("BACKUP_PEER_SIGNALING_URL");
        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn valid_env_produces_a_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BACKUP_PEER_SIGNALING_URL", "wss://example.invalid/signal");
        std::env::set_var("BACKUP_PEER_CHUNK_SIZE", "1024");
        let config = Config::from_env().unwrap();
        assert_eq!(config.chunk_size, 1024);
        std::env::remove_var("BACKUP_PEER_SIGNALING_URL");
        std::env::remove_var("BACKUP_PEER_CHUNK_SIZE");
    }
}
