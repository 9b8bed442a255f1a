// =============================================================================
// SYNAPSE NODE : error.rs
// Error taxonomy for the session and topology engine
// =============================================================================
//
//   NetworkError  : everything surfaced by Network / Node operations
//   ProtocolError : malformed or invalid envelopes
//   CryptoError   : key handling, handshake verification, hybrid encryption
//   ConfigError   : loading and validating configuration
// =============================================================================

use crate::constants::{
    ERROR_CODE_CONNECTION_FAILED, ERROR_CODE_INVALID_MESSAGE, ERROR_CODE_MAX_PEERS_REACHED,
    ERROR_CODE_PEER_NOT_FOUND, ERROR_CODE_TIMEOUT,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("capacity reached: {0}")]
    Capacity(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] CryptoError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state: {0}")]
    State(String),

    #[error("peer {0} not found")]
    UnknownPeer(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The remote answered the handshake with an ERROR envelope.
    #[error("rejected by remote: {code}: {message}")]
    Rejected { code: String, message: String },
}

impl NetworkError {
    pub fn state(msg: &str) -> Self {
        NetworkError::State(msg.to_string())
    }

    /// Code carried in the ERROR payload sent to a peer for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            NetworkError::Protocol(_) => ERROR_CODE_INVALID_MESSAGE,
            NetworkError::Capacity(_) => ERROR_CODE_MAX_PEERS_REACHED,
            NetworkError::UnknownPeer(_) => ERROR_CODE_PEER_NOT_FOUND,
            NetworkError::Timeout(_) => ERROR_CODE_TIMEOUT,
            NetworkError::Config(_)
            | NetworkError::Handshake(_)
            | NetworkError::Io(_)
            | NetworkError::State(_)
            | NetworkError::Rejected { .. } => ERROR_CODE_CONNECTION_FAILED,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message {0} cannot be empty")]
    EmptyField(&'static str),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload does not match message type {kind}: {reason}")]
    PayloadMismatch { kind: String, reason: String },

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    /// Signature does not verify against the embedded key.
    #[error("handshake verification failed: {0}")]
    Verification(String),

    /// Handshake timestamp outside the accepted skew window.
    #[error("handshake expired: timestamp skew {skew_secs}s exceeds {tolerance_secs}s")]
    Expired { skew_secs: i64, tolerance_secs: i64 },

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Ciphertext shorter than the RSA key block plus nonce.
    #[error("corrupt message: {0}")]
    CorruptMessage(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = NetworkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_converts_to_handshake() {
        let err: NetworkError = CryptoError::Verification("bad sig".into()).into();
        assert!(matches!(err, NetworkError::Handshake(CryptoError::Verification(_))));
        assert!(err.to_string().contains("bad sig"));
    }

    #[test]
    fn test_wire_codes() {
        let cases: Vec<(NetworkError, &str)> = vec![
            (ProtocolError::EmptyField("id").into(), "INVALID_MESSAGE"),
            (NetworkError::Capacity("pool full".into()), "MAX_PEERS_REACHED"),
            (NetworkError::UnknownPeer("x".into()), "PEER_NOT_FOUND"),
            (NetworkError::Timeout("handshake receive".into()), "TIMEOUT"),
            (CryptoError::Verification("bad sig".into()).into(), "CONNECTION_FAILED"),
            (NetworkError::state("closed"), "CONNECTION_FAILED"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code, "{}", err);
        }
    }

    #[test]
    fn test_expired_message() {
        let err = CryptoError::Expired { skew_secs: 301, tolerance_secs: 300 };
        assert_eq!(
            err.to_string(),
            "handshake expired: timestamp skew 301s exceeds 300s"
        );
    }
}
