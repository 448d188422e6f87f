//! Error taxonomy and propagation metadata for the peer core.
//!
//! A single `Error` enum covers every component's failure kinds (§7). Each
//! variant carries a stable `code()`, an `ErrorCategory`, an `ErrorSeverity`,
//! and a `RetryStrategy` so the dispatcher and task-top error handlers can
//! decide uniformly whether to retry, drop, degrade, or close the session.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Monitoring category for an error, independent of its specific variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Crypto,
    Identity,
    Transport,
    RateLimit,
    Allocation,
    Store,
    Transfer,
    Verification,
    Protocol,
}

/// Severity used to decide how loudly to log and whether to page an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// What a caller should do in response to this error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Not retryable; the operation or session must be abandoned/closed.
    NoRetry,
    /// Retry up to `max_attempts` times with no mandated delay.
    RetryImmediate { max_attempts: u32 },
    /// Drop silently; no retry is meaningful (e.g. a malformed frame).
    Drop,
}

/// The crate-wide error type. Every component returns this; no component
/// defines its own parallel error enum.
#[derive(Debug, Error)]
pub enum Error {
    // --- CryptoError ---
    #[error("crypto: signing or encryption key is missing")]
    KeyMissing,
    #[error("crypto: signature is invalid")]
    SignatureInvalid,
    #[error("crypto: decryption failed")]
    DecryptionFailed,
    #[error("crypto: hash mismatch")]
    CryptoHashMismatch,

    // --- IdentityError ---
    #[error("identity: protocol version unsupported")]
    VersionUnsupported,
    #[error("identity: signed identity expired")]
    IdentityExpired,
    #[error("identity: peer-id-hash does not match public key")]
    IdentityHashMismatch,
    #[error("identity: public key has the wrong length")]
    IdentityKeyLength,

    // --- TransportError ---
    #[error("transport: matching with signaling broker timed out")]
    MatchingTimeout,
    #[error("transport: channel closed")]
    ChannelClosed,
    #[error("transport: send backpressure timeout")]
    BackpressureTimeout,

    // --- RateLimitError ---
    #[error("rate limit: burst window exceeded")]
    RateLimitBurst,
    #[error("rate limit: coarse window exceeded")]
    RateLimitWindow,
    #[error("rate limit: per-message-type cap exceeded")]
    RateLimitMessageType,
    #[error("rate limit: peer is temporarily banned")]
    RateLimitBanned,

    // --- AllocationError ---
    #[error("allocation: give-to-get ratio would be violated")]
    AllocationRatioViolation,
    #[error("allocation: global capacity exhausted")]
    AllocationCapacityExhausted,

    // --- StoreError ---
    #[error("store: io error: {0}")]
    StoreIo(String),
    #[error("store: schema error: {0}")]
    StoreSchema(String),
    #[error("store: field decryption failed")]
    StoreFieldDecrypt,

    // --- TransferError ---
    #[error("transfer: chunk integrity check failed")]
    ChunkIntegrity,
    #[error("transfer: file integrity check failed")]
    FileIntegrity,
    #[error("transfer: chunk missing")]
    MissingChunk,
    #[error("transfer: retries exhausted")]
    RetryExhausted,
    #[error("transfer: source file changed since chunk was recorded")]
    SourceChanged,

    // --- VerificationError ---
    #[error("verification: unknown challenge id")]
    UnknownChallenge,
    #[error("verification: unsupported challenge kind")]
    UnsupportedChallengeKind,
    #[error("verification: proof did not match")]
    ProofMismatch,
    #[error("verification: challenge timed out")]
    VerificationTimeout,
    #[error("verification: challenge expired before response")]
    ChallengeExpired,

    // --- ProtocolError ---
    #[error("protocol: malformed message: {0}")]
    Malformed(String),
    #[error("protocol: unknown message type: {0}")]
    UnknownType(String),

    // --- Config / bootstrap ---
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Stable discriminant suitable for telemetry and for matching in tests.
    pub fn code(&self) -> &'static str {
        match self {
            Error::KeyMissing => "crypto.key_missing",
            Error::SignatureInvalid => "crypto.signature_invalid",
            Error::DecryptionFailed => "crypto.decryption_failed",
            Error::CryptoHashMismatch => "crypto.hash_mismatch",
            Error::VersionUnsupported => "identity.version_unsupported",
            Error::IdentityExpired => "identity.expired",
            Error::IdentityHashMismatch => "identity.hash_mismatch",
            Error::IdentityKeyLength => "identity.key_length",
            Error::MatchingTimeout => "transport.matching_timeout",
            Error::ChannelClosed => "transport.channel_closed",
            Error::BackpressureTimeout => "transport.backpressure_timeout",
            Error::RateLimitBurst => "rate_limit.burst",
            Error::RateLimitWindow => "rate_limit.window",
            Error::RateLimitMessageType => "rate_limit.message_type",
            Error::RateLimitBanned => "rate_limit.banned",
            Error::AllocationRatioViolation => "allocation.ratio_violation",
            Error::AllocationCapacityExhausted => "allocation.capacity_exhausted",
            Error::StoreIo(_) => "store.io",
            Error::StoreSchema(_) => "store.schema",
            Error::StoreFieldDecrypt => "store.field_decrypt",
            Error::ChunkIntegrity => "transfer.chunk_integrity",
            Error::FileIntegrity => "transfer.file_integrity",
            Error::MissingChunk => "transfer.missing_chunk",
            Error::RetryExhausted => "transfer.retry_exhausted",
            Error::SourceChanged => "transfer.source_changed",
            Error::UnknownChallenge => "verification.unknown_challenge",
            Error::UnsupportedChallengeKind => "verification.unsupported_kind",
            Error::ProofMismatch => "verification.proof_mismatch",
            Error::VerificationTimeout => "verification.timeout",
            Error::ChallengeExpired => "verification.challenge_expired",
            Error::Malformed(_) => "protocol.malformed",
            Error::UnknownType(_) => "protocol.unknown_type",
            Error::Config(_) => "config.invalid",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::KeyMissing
            | Error::SignatureInvalid
            | Error::DecryptionFailed
            | Error::CryptoHashMismatch => ErrorCategory::Crypto,
            Error::VersionUnsupported
            | Error::IdentityExpired
            | Error::IdentityHashMismatch
            | Error::IdentityKeyLength => ErrorCategory::Identity,
            Error::MatchingTimeout | Error::ChannelClosed | Error::BackpressureTimeout => {
                ErrorCategory::Transport
            }
            Error::RateLimitBurst
            | Error::RateLimitWindow
            | Error::RateLimitMessageType
            | Error::RateLimitBanned => ErrorCategory::RateLimit,
            Error::AllocationRatioViolation | Error::AllocationCapacityExhausted => {
                ErrorCategory::Allocation
            }
            Error::StoreIo(_) | Error::StoreSchema(_) | Error::StoreFieldDecrypt => {
                ErrorCategory::Store
            }
            Error::ChunkIntegrity
            | Error::FileIntegrity
            | Error::MissingChunk
            | Error::RetryExhausted
            | Error::SourceChanged => ErrorCategory::Transfer,
            Error::UnknownChallenge
            | Error::UnsupportedChallengeKind
            | Error::ProofMismatch
            | Error::VerificationTimeout
            | Error::ChallengeExpired => ErrorCategory::Verification,
            Error::Malformed(_) | Error::UnknownType(_) => ErrorCategory::Protocol,
            Error::Config(_) => ErrorCategory::Protocol,
        }
    }

    /// Severity drives log level; it does not by itself decide propagation.
    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Crypto | ErrorCategory::Identity => ErrorSeverity::Critical,
            ErrorCategory::Transport | ErrorCategory::Store => ErrorSeverity::High,
            ErrorCategory::Transfer | ErrorCategory::Allocation => ErrorSeverity::Medium,
            ErrorCategory::Verification | ErrorCategory::RateLimit | ErrorCategory::Protocol => {
                ErrorSeverity::Low
            }
        }
    }

    /// Per §7's propagation table: does this error close the owning session?
    pub fn closes_session(&self) -> bool {
        matches!(self.category(), ErrorCategory::Crypto)
    }

    /// Per §7: is this message simply dropped with no other effect?
    pub fn is_dropped(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit | ErrorCategory::Protocol
        )
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Error::ChunkIntegrity | Error::MissingChunk => {
                RetryStrategy::RetryImmediate { max_attempts: 3 }
            }
            Error::Malformed(_) | Error::UnknownType(_) => RetryStrategy::Drop,
            _ => RetryStrategy::NoRetry,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.retry_strategy(), RetryStrategy::RetryImmediate { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StoreIo(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreSchema(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_errors_close_the_session() {
        assert!(Error::SignatureInvalid.closes_session());
        assert!(!Error::RateLimitBurst.closes_session());
    }

    #[test]
    fn rate_limit_and_protocol_errors_are_dropped() {
        assert!(Error::RateLimitWindow.is_dropped());
        assert!(Error::Malformed("bad".into()).is_dropped());
        assert!(!Error::ChunkIntegrity.is_dropped());
    }

    #[test]
    fn chunk_errors_are_retryable_up_to_three_attempts() {
        match Error::ChunkIntegrity.retry_strategy() {
            RetryStrategy::RetryImmediate { max_attempts } => assert_eq!(max_attempts, 3),
            _ => panic!("expected retryable"),
        }
    }

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(Error::AllocationRatioViolation.code(), "allocation.ratio_violation");
    }
}
