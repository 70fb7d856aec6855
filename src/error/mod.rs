//! Error types and structured classification for meshline.
//!
//! Every fallible boundary in the crate returns this one `Error` enum so that
//! callers — in particular the message manager and the boundary adapter —
//! can classify a failure without matching on string content.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification used for metrics and log grouping. Never used for
/// control flow — match on `Error` variants for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Protocol,
    Crypto,
    Session,
    Transport,
    Storage,
    Configuration,
}

/// Severity for alerting; derived from category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorCategory {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Crypto | Self::Session => ErrorSeverity::Critical,
            Self::Transport | Self::Storage => ErrorSeverity::High,
            Self::Protocol => ErrorSeverity::Medium,
            Self::Configuration => ErrorSeverity::Low,
        }
    }
}

/// Whether and how a failed operation should be retried. The Message Manager
/// and Nostr relay pool consult this before reaching for
/// [`crate::resilience::RetryExecutor`]; it decides retryability, not timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Never retry; the caller must take a different action.
    None,
    /// Safe to retry right away (e.g. a transient codec drop).
    Immediate,
    /// Retry with exponential backoff.
    Backoff,
    /// Requires explicit user/operator action before retrying.
    Manual,
}

#[derive(Debug, Error)]
pub enum Error {
    // --- §7 protocol / codec kinds ---
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("reassembly timed out for message {0}")]
    ReassemblyTimeout(String),

    // --- crypto / handshake kinds ---
    #[error("cryptographic failure: {0}")]
    CryptoFailure(String),

    #[error("unexpected handshake message for peer {0}")]
    UnexpectedHandshakeMessage(String),

    #[error("handshake timed out for peer {0}")]
    HandshakeTimeout(String),

    #[error("handshake already in progress for peer {0}")]
    HandshakeInProgress(String),

    #[error("no session for peer {0}")]
    NoSession(String),

    // --- routing / transport kinds ---
    #[error("peer {0} is blocked")]
    PeerBlocked(String),

    #[error("peer {0} is unreachable")]
    PeerUnreachable(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("relay error: {0}")]
    RelayError(String),

    // --- storage / outbox kinds ---
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("outbox entry {0} expired")]
    OutboxExpired(String),

    // --- ambient wrappers (§4.12) ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Stable short code for telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPacket(_) => "E_INVALID_PACKET",
            Self::UnknownMessageType(_) => "E_UNKNOWN_TYPE",
            Self::PayloadTooLarge(_) => "E_OVERSIZED_PAYLOAD",
            Self::ReassemblyTimeout(_) => "E_REASSEMBLY_TIMEOUT",
            Self::CryptoFailure(_) => "E_CRYPTO",
            Self::UnexpectedHandshakeMessage(_) => "E_HANDSHAKE_SEQUENCE",
            Self::HandshakeTimeout(_) => "E_HANDSHAKE_TIMEOUT",
            Self::HandshakeInProgress(_) => "E_HANDSHAKE_IN_PROGRESS",
            Self::NoSession(_) => "E_NO_SESSION",
            Self::PeerBlocked(_) => "E_PEER_BLOCKED",
            Self::PeerUnreachable(_) => "E_PEER_UNREACHABLE",
            Self::TransportUnavailable(_) => "E_TRANSPORT_UNAVAILABLE",
            Self::RelayError(_) => "E_RELAY",
            Self::StorageError(_) => "E_STORAGE",
            Self::OutboxExpired(_) => "E_OUTBOX_EXPIRED",
            Self::Io(_) => "E_IO",
            Self::Serialization(_) => "E_SERIALIZATION",
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => "E_SQLITE",
            Self::Config(_) => "E_CONFIG",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPacket(_)
            | Self::UnknownMessageType(_)
            | Self::PayloadTooLarge(_)
            | Self::ReassemblyTimeout(_) => ErrorCategory::Protocol,

            Self::CryptoFailure(_) => ErrorCategory::Crypto,

            Self::UnexpectedHandshakeMessage(_)
            | Self::HandshakeTimeout(_)
            | Self::HandshakeInProgress(_)
            | Self::NoSession(_) => ErrorCategory::Session,

            Self::PeerBlocked(_)
            | Self::PeerUnreachable(_)
            | Self::TransportUnavailable(_)
            | Self::RelayError(_) => ErrorCategory::Transport,

            Self::StorageError(_) | Self::OutboxExpired(_) => ErrorCategory::Storage,

            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => ErrorCategory::Storage,
            Self::Io(_) | Self::Serialization(_) => ErrorCategory::Storage,

            Self::Config(_) => ErrorCategory::Configuration,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.category().severity()
    }

    /// Recommended retry handling; independent of category.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::ReassemblyTimeout(_)
            | Self::TransportUnavailable(_)
            | Self::RelayError(_)
            | Self::PeerUnreachable(_) => RetryStrategy::Backoff,

            Self::InvalidPacket(_) | Self::UnknownMessageType(_) | Self::PayloadTooLarge(_) => {
                RetryStrategy::None
            }

            Self::CryptoFailure(_)
            | Self::UnexpectedHandshakeMessage(_)
            | Self::HandshakeTimeout(_)
            | Self::HandshakeInProgress(_)
            | Self::NoSession(_) => RetryStrategy::Manual,

            Self::PeerBlocked(_) | Self::OutboxExpired(_) => RetryStrategy::None,

            Self::StorageError(_) => RetryStrategy::Immediate,
            Self::Io(_) | Self::Serialization(_) => RetryStrategy::Immediate,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => RetryStrategy::Immediate,

            Self::Config(_) => RetryStrategy::Manual,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.retry_strategy(), RetryStrategy::None | RetryStrategy::Manual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_maps_to_severity() {
        let err = Error::CryptoFailure("auth tag mismatch".into());
        assert_eq!(err.category(), ErrorCategory::Crypto);
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn transport_errors_are_retryable() {
        let err = Error::PeerUnreachable("deadbeefcafebabe".into());
        assert!(err.is_retryable());
        assert_eq!(err.retry_strategy(), RetryStrategy::Backoff);
    }

    #[test]
    fn handshake_sequence_errors_require_manual_retry() {
        let err = Error::HandshakeInProgress("deadbeefcafebabe".into());
        assert!(!err.is_retryable());
    }
}
