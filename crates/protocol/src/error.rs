//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// Most handshake errors are fatal: the session stalls and every further
/// [`decode`](crate::Session::decode) or [`encode`](crate::Session::encode)
/// call fails with [`ProtocolError::SessionFailed`]. The exceptions are
/// listed under [`is_fatal`](ProtocolError::is_fatal).
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Handshake errors
    /// The peer's advertised version window does not overlap ours.
    #[error("protocol version mismatch: peer supports {peer_min}..={peer_max}")]
    VersionMismatch {
        /// Minimum version advertised by the peer.
        peer_min: u8,
        /// Maximum version advertised by the peer.
        peer_max: u8,
    },

    /// The server demanded a proof-of-work difficulty above the protocol cap.
    #[error("challenge difficulty too high: {difficulty} bits exceeds maximum of {max} bits")]
    DifficultyTooHigh {
        /// Requested difficulty in bits.
        difficulty: u8,
        /// Highest difficulty this implementation accepts.
        max: u8,
    },

    /// Mutual authentication is required but no tag was supplied.
    #[error("mutual authentication required but no tag was presented")]
    MutualAuthRequired,

    /// A tag exceeded the maximum encodable length.
    #[error("tag too long: {len} bytes exceeds maximum of {max} bytes")]
    TagTooLong {
        /// Declared tag length.
        len: usize,
        /// Maximum allowed tag length.
        max: usize,
    },

    /// A tag failed verification: untrusted issuer, bad issuer signature,
    /// malformed encoding, or validity window violation.
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// A handshake binding signature failed verification.
    #[error("invalid signature")]
    InvalidSignature,

    /// The peer claimed a proof-of-work solution that does not check out,
    /// or the server exhausted its renegotiation budget.
    #[error("proof-of-work challenge failed")]
    ChallengeFailed,

    /// A received record's MAC did not match. The record is dropped;
    /// the session itself remains usable.
    #[error("record integrity failure: MAC mismatch")]
    RecordIntegrity,

    /// An echoed nonce came back modified. Possible injection attack.
    #[error("nonce echo failed")]
    NonceEchoFailed,

    // Crypto errors
    /// The counter-mode keystream is about to wrap; the key must be retired.
    #[error("cipher counter exhausted: refusing to reuse keystream")]
    CounterExhausted,

    /// An HKDF expansion requested more output than 255 hash blocks.
    #[error("key derivation too long: {requested} bytes exceeds maximum of {max} bytes")]
    DerivationTooLong {
        /// Requested output length.
        requested: usize,
        /// Maximum derivable length for the hash in use.
        max: usize,
    },

    // Session usage errors
    /// `encode` was called before the handshake completed.
    #[error("session has not been established")]
    NotEstablished,

    /// The session previously hit a fatal error and must be discarded.
    #[error("session has failed and must be discarded")]
    SessionFailed,

    /// An outbound payload exceeded the 16-bit record length field.
    #[error("payload too large: {len} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Payload length supplied by the caller.
        len: usize,
        /// Maximum payload length per record.
        max: usize,
    },

    /// A frame could not be parsed from the wire.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// The session was constructed or driven with an invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProtocolError {
    /// Returns whether this error leaves the session unusable.
    ///
    /// Only [`RecordIntegrity`](ProtocolError::RecordIntegrity) is
    /// per-record recoverable; everything else is session-fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::RecordIntegrity)
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_display() {
        let err = ProtocolError::VersionMismatch {
            peer_min: 2,
            peer_max: 3,
        };
        assert_eq!(err.to_string(), "protocol version mismatch: peer supports 2..=3");
    }

    #[test]
    fn test_difficulty_too_high_display() {
        let err = ProtocolError::DifficultyTooHigh {
            difficulty: 31,
            max: 24,
        };
        assert_eq!(
            err.to_string(),
            "challenge difficulty too high: 31 bits exceeds maximum of 24 bits"
        );
    }

    #[test]
    fn test_tag_too_long_display() {
        let err = ProtocolError::TagTooLong {
            len: 2048,
            max: 1024,
        };
        assert_eq!(
            err.to_string(),
            "tag too long: 2048 bytes exceeds maximum of 1024 bytes"
        );
    }

    #[test]
    fn test_record_integrity_is_not_fatal() {
        assert!(!ProtocolError::RecordIntegrity.is_fatal());
    }

    #[test]
    fn test_handshake_errors_are_fatal() {
        assert!(ProtocolError::NonceEchoFailed.is_fatal());
        assert!(ProtocolError::InvalidSignature.is_fatal());
        assert!(ProtocolError::ChallengeFailed.is_fatal());
        assert!(ProtocolError::MutualAuthRequired.is_fatal());
        assert!(ProtocolError::InvalidTag("expired".into()).is_fatal());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
