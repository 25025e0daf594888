//! Error types for the tunnel engine.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Invalid or missing configuration. Fails the attempt before any socket is opened.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("config error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure while authenticating with the relay.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out after {0:?} waiting for auth challenge")]
    ChallengeTimeout(Duration),

    #[error("timed out after {0:?} waiting for auth confirmation")]
    ConfirmationTimeout(Duration),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("invalid challenge: missing challenge_id or challenge")]
    InvalidChallenge,

    #[error("authentication failed: {0}")]
    Rejected(String),

    #[error("malformed handshake message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("failed to sign auth token: {0}")]
    Signing(#[from] SignError),

    #[error("connection closed during handshake")]
    Closed,

    #[error("transport error during handshake: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Transport-level failure of an established connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to relay: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("timed out after {0:?} connecting to relay")]
    ConnectTimeout(Duration),

    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("connection closed by relay")]
    Closed,

    #[error("no data received from relay for {0:?}")]
    Stale(Duration),

    #[error("outbound writer stopped")]
    WriterClosed,
}

/// Local call failure. Contained by the forwarder and turned into a 502.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("local service timed out after {0:?}")]
    Timeout(Duration),

    #[error("local service unreachable: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("local request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Token signing failure reported by a [`Signer`](crate::auth::Signer).
#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to build token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("signing key unavailable: {0}")]
    Key(String),
}

/// Why a single connection attempt ended. Always retried.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::new("services list is empty");
        assert_eq!(err.to_string(), "config error: services list is empty");
    }

    #[test]
    fn test_rejection_message_carries_reason() {
        let err = TunnelError::from(HandshakeError::Rejected("bad signature".into()));
        assert_eq!(err.to_string(), "authentication failed: bad signature");
    }

    #[test]
    fn test_stale_message_names_the_silence() {
        let err = TunnelError::from(ConnectionError::Stale(std::time::Duration::from_secs(40)));
        assert!(err.to_string().starts_with("no data received from relay"));
    }
}
