//! Application coordinator: owns every long-lived component and wires
//! them together (§5 — the dispatcher task, keepalive task, verification
//! scheduler, and store-maintenance task, all sharing a small thread
//! pool). Grounded on the teacher's `BitCrapsApp`/`AppState` coordinator
//! shape — one struct holding `Arc`s to each subsystem, built once at
//! startup and handed to every background task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::allocation::AllocationLedger;
use crate::config::Config;
use crate::crypto::Crypto;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::reputation::ReputationEngine;
use crate::store::Store;
use crate::transfer::TransferPipeline;
use crate::transport::{
    MatchingService, SessionManagerConfig, SignalingClient, TransportCoordinator,
    WebSocketSignalingClient,
};
use crate::verification::VerificationEngine;

/// Everything a running peer needs, constructed once from `Config`.
pub struct PeerApp {
    pub config: Config,
    pub crypto: Arc<Crypto>,
    pub store: Arc<Store>,
    pub rate_limiter: Arc<RateLimiter>,
    pub reputation: Arc<ReputationEngine>,
    pub allocation: Arc<AllocationLedger>,
    pub transport: Arc<TransportCoordinator>,
    pub transfer: Arc<TransferPipeline>,
    pub verification: Arc<VerificationEngine>,
    pub dispatcher: Arc<Dispatcher>,
    inbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<(String, crate::message::PeerMessage)>>>,
    matching: tokio::sync::OnceCell<Arc<MatchingService>>,
}

impl PeerApp {
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.home)?;
        std::fs::create_dir_all(config.keys_dir())?;
        std::fs::create_dir_all(config.backups_dir())?;
        std::fs::create_dir_all(config.received_chunks_dir())?;

        let crypto = Arc::new(Crypto::load_or_generate(&config.keys_dir())?);
        let store = Arc::new(Store::open(&config.db_path(), &crypto.public_signing_key())?);
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let reputation = Arc::new(ReputationEngine::new(config.reputation.clone()));
        let allocation = Arc::new(AllocationLedger::with_snapshot(
            config.max_offered_global,
            config.allocation_snapshot_path(),
        ));
        let verification = Arc::new(VerificationEngine::new());
        let transfer = Arc::new(TransferPipeline::new(
            store.clone(),
            config.received_dir(),
            config.received_chunks_dir(),
        ));

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let transport = Arc::new(TransportCoordinator::new(SessionManagerConfig::default(), inbound_tx));

        let dispatcher = Arc::new(Dispatcher::new(
            crypto.clone(),
            store.clone(),
            rate_limiter.clone(),
            reputation.clone(),
            allocation.clone(),
            transport.clone(),
            transfer.clone(),
            verification.clone(),
        ));

        Ok(Self {
            config,
            crypto,
            store,
            rate_limiter,
            reputation,
            allocation,
            transport,
            transfer,
            verification,
            dispatcher,
            inbound_rx: tokio::sync::Mutex::new(Some(inbound_rx)),
            matching: tokio::sync::OnceCell::new(),
        })
    }

    /// Start every background task (§5): the dispatcher loop, the
    /// verification scheduler, and store maintenance. Returns once all
    /// tasks have been spawned; they run for the lifetime of the process.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(peer_id_hash = %self.crypto.peer_id_hash(), "starting backup-peer");

        let inbound_rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .expect("PeerApp::run called more than once");
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.run(inbound_rx).await;
        });

        let signaling: Arc<dyn SignalingClient> =
            Arc::new(WebSocketSignalingClient::connect(&self.config.signaling_url).await?);
        let matching = Arc::new(MatchingService::new(
            self.crypto.clone(),
            self.transport.clone(),
            signaling,
            self.config.listen_port,
        ));
        matching.clone().run().await?;
        self.matching
            .set(matching)
            .map_err(|_| Error::Config("PeerApp::run called more than once".into()))?;

        self.spawn_verification_scheduler();
        self.spawn_store_maintenance();
        self.spawn_rate_limiter_gc();
        self.spawn_keepalive();
        self.spawn_reconnect_supervisor();
        self.spawn_reputation_flush();

        Ok(())
    }

    /// Periodic challenge sweep (§4.9 Scheduling): once per
    /// `challenge_cadence`, issue one random-blocks challenge per `sent`
    /// backup in `active` status, spaced by at least 1 s.
    fn spawn_verification_scheduler(self: &Arc<Self>) {
        let app = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(app.config.challenge_cadence);
            loop {
                ticker.tick().await;
                let Ok(backup_ids) = app.store.list_backups_by_status(
                    crate::store::models::BackupStatus::Active,
                    crate::store::models::BackupDirection::Sent,
                ) else {
                    continue;
                };
                for backup_id in backup_ids {
                    let Ok(Some(backup)) = app.store.get_backup(&backup_id) else {
                        continue;
                    };
                    let challenge = app.verification.issue_random_blocks(&backup_id);
                    let _ = app.transport.send(&backup.counterparty_peer_id_hash, challenge).await;
                    tokio::time::sleep(crate::verification::challenge_spacing()).await;
                }
            }
        });
    }

    /// Periodic persistent-store maintenance (§4.2): purge expired
    /// challenges, stale cached connections, and settled chunk rows.
    fn spawn_store_maintenance(self: &Arc<Self>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                if let Err(e) = store.purge_expired() {
                    tracing::warn!(error = %e, "store maintenance pass failed");
                }
            }
        });
    }

    fn spawn_rate_limiter_gc(self: &Arc<Self>) {
        let rate_limiter = self.rate_limiter.clone();
        let interval = self.config.rate_limit.coarse_window / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                rate_limiter.gc();
            }
        });
    }

    /// Periodic signed pings to every connected peer (§4.6); a peer whose
    /// missed-ack count reaches the threshold is dropped into
    /// `Reconnecting` for the reconnect supervisor to pick up.
    fn spawn_keepalive(self: &Arc<Self>) {
        let app = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(app.config.keepalive_interval);
            loop {
                ticker.tick().await;
                for peer_id_hash in app.transport.tick_keepalive().await {
                    tracing::warn!(peer = %peer_id_hash, "keepalive missed ack threshold reached");
                    app.transport.enter_reconnecting(&peer_id_hash).await;
                }
            }
        });
    }

    /// Sweeps peers sitting in `Reconnecting`, re-entering the signaling
    /// conversation with exponential backoff and giving up after
    /// `keepalive::MAX_RECONNECT_ATTEMPTS` (§4.6).
    fn spawn_reconnect_supervisor(self: &Arc<Self>) {
        let app = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let Some(matching) = app.matching.get() else {
                    continue;
                };
                let peers = app
                    .transport
                    .sessions
                    .peers_in_state(crate::transport::SessionState::Reconnecting)
                    .await;
                for peer_id_hash in peers {
                    let attempt = app.transport.sessions.increment_reconnect_attempts(&peer_id_hash).await;
                    if crate::transport::keepalive::reconnect_attempts_exhausted(attempt) {
                        tracing::warn!(peer = %peer_id_hash, "reconnect attempts exhausted, giving up");
                        app.transport
                            .sessions
                            .transition(&peer_id_hash, crate::transport::SessionState::Closed)
                            .await
                            .ok();
                        app.transport.sessions.reset_reconnect_attempts(&peer_id_hash).await;
                        continue;
                    }
                    tokio::time::sleep(crate::transport::keepalive::reconnect_backoff(attempt)).await;
                    if let Err(e) = matching.request_connection(&peer_id_hash).await {
                        tracing::warn!(peer = %peer_id_hash, error = %e, "reconnect request failed");
                    }
                }
            }
        });
    }

    /// Flush reputation records to the store whenever the engine's
    /// dirty-event counter crosses its threshold (§4.5).
    fn spawn_reputation_flush(self: &Arc<Self>) {
        let app = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if app.reputation.should_flush() {
                    if let Err(e) = app.reputation.flush(&app.store) {
                        tracing::warn!(error = %e, "reputation flush failed");
                    }
                }
            }
        });
    }
}
