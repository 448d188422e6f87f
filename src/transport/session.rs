//! Session manager: owns the per-peer session-state map and validates
//! transitions through it. Grounded directly on the teacher's
//! `SessionLifecycleManager` (`Arc<RwLock<HashMap<PeerId, ManagedSession>>>`
//! plus a tuple-match transition validator).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::transport::state::SessionState;

pub struct ManagedSession {
    pub peer_id_hash: String,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_attempts: u32,
}

impl ManagedSession {
    fn new(peer_id_hash: String) -> Self {
        let now = Instant::now();
        Self {
            peer_id_hash,
            state: SessionState::Idle,
            created_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
            reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub session_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_sessions: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            handshake_timeout: Duration::from_secs(30),
            max_sessions: 4096,
        }
    }
}

pub struct SessionManager {
    config: SessionManagerConfig,
    sessions: Arc<RwLock<HashMap<String, ManagedSession>>>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create_session(&self, peer_id_hash: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(Error::ChannelClosed);
        }
        sessions
            .entry(peer_id_hash.to_string())
            .or_insert_with(|| ManagedSession::new(peer_id_hash.to_string()));
        Ok(())
    }

    pub async fn transition(&self, peer_id_hash: &str, next: SessionState) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(peer_id_hash)
            .ok_or(Error::ChannelClosed)?;
        if !session.state.can_transition_to(next) {
            return Err(Error::ChannelClosed);
        }
        session.state = next;
        session.last_activity = Instant::now();
        Ok(())
    }

    pub async fn state_of(&self, peer_id_hash: &str) -> Option<SessionState> {
        self.sessions.read().await.get(peer_id_hash).map(|s| s.state)
    }

    pub async fn record_activity(&self, peer_id_hash: &str, sent: u64, received: u64) {
        if let Some(session) = self.sessions.write().await.get_mut(peer_id_hash) {
            session.bytes_sent += sent;
            session.bytes_received += received;
            session.last_activity = Instant::now();
        }
    }

    pub async fn terminate_session(&self, peer_id_hash: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(peer_id_hash) {
            session.state = SessionState::Closed;
        }
    }

    /// Evict sessions that have been idle past `session_timeout`.
    pub async fn cleanup_stale_sessions(&self) -> Vec<String> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > self.config.session_timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            sessions.remove(key);
        }
        stale
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.state == SessionState::Connected)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// All peers currently sitting in `state`, e.g. `Reconnecting` for the
    /// reconnect supervisor's sweep (§4.6).
    pub async fn peers_in_state(&self, state: SessionState) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.state == state)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub async fn increment_reconnect_attempts(&self, peer_id_hash: &str) -> u32 {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(peer_id_hash) {
            Some(session) => {
                session.reconnect_attempts += 1;
                session.reconnect_attempts
            }
            None => 0,
        }
    }

    pub async fn reset_reconnect_attempts(&self, peer_id_hash: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(peer_id_hash) {
            session.reconnect_attempts = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn legal_transition_sequence_succeeds() {
        let manager = SessionManager::new(SessionManagerConfig::default());
        manager.create_session("peer1").await.unwrap();
        manager.transition("peer1", SessionState::Matching).await.unwrap();
        manager.transition("peer1", SessionState::Handshaking).await.unwrap();
        manager.transition("peer1", SessionState::Connected).await.unwrap();
        assert_eq!(manager.state_of("peer1").await, Some(SessionState::Connected));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let manager = SessionManager::new(SessionManagerConfig::default());
        manager.create_session("peer1").await.unwrap();
        let result = manager.transition("peer1", SessionState::Connected).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn max_sessions_is_enforced() {
        let manager = SessionManager::new(SessionManagerConfig {
            max_sessions: 1,
            ..SessionManagerConfig::default()
        });
        manager.create_session("peer1").await.unwrap();
        assert!(manager.create_session("peer2").await.is_err());
    }
}
