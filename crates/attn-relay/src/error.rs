//! Error types for attn-relay.

use serde::Serialize;
use thiserror::Error;

/// Errors raised by a relay transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Send attempted while the socket is not open.
    #[error("transport is not open")]
    NotOpen,
    /// The underlying WebSocket reported an error.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// The socket closed underneath the caller.
    #[error("transport closed")]
    Closed,
}

/// Errors raised by an event signer.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Connection timeout")]
    ConnectionTimeout,
    #[error("{reason}")]
    ConnectionClosed { reason: String },
    #[error("Authentication rejected by relay: {0}")]
    AuthRejected(String),
    #[error("Authentication timeout: No OK response received")]
    AuthTimeout,
    #[error("signer error: {0}")]
    Signer(#[from] SignerError),
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("missing env var: {0}")]
    MissingEnv(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("connection task stopped")]
    SessionStopped,
}

impl Error {
    /// Stable snake_case label for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::ConnectionTimeout => "connection_timeout",
            Error::ConnectionClosed { .. } => "connection_closed",
            Error::AuthRejected(_) => "auth_rejected",
            Error::AuthTimeout => "auth_timeout",
            Error::Signer(_) => "signer",
            Error::Json(_) => "json",
            Error::Url(_) => "url",
            Error::Disconnected(_) => "disconnected",
            Error::MissingEnv(_) => "missing_env",
            Error::InvalidConfig(_) => "invalid_config",
            Error::SessionStopped => "session_stopped",
        }
    }
}

/// Normalized error shape attached to notifications.
///
/// Whatever the underlying representation (tungstenite error, close frame,
/// signer failure), listeners always see `{ message, code?, kind? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            kind: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

impl From<&Error> for ErrorInfo {
    fn from(err: &Error) -> Self {
        ErrorInfo::new(err.to_string()).with_kind(err.kind())
    }
}

impl From<&TransportError> for ErrorInfo {
    fn from(err: &TransportError) -> Self {
        ErrorInfo::new(err.to_string()).with_kind("transport")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_messages_match_relay_wording() {
        assert_eq!(
            Error::AuthRejected("blocked".to_string()).to_string(),
            "Authentication rejected by relay: blocked"
        );
        assert_eq!(
            Error::AuthTimeout.to_string(),
            "Authentication timeout: No OK response received"
        );
    }

    #[test]
    fn test_error_info_normalization() {
        let info = ErrorInfo::from(&Error::ConnectionTimeout);
        assert_eq!(info.message, "Connection timeout");
        assert_eq!(info.kind.as_deref(), Some("connection_timeout"));
        assert!(info.code.is_none());

        let json = serde_json::to_value(ErrorInfo::new("closed").with_code(1006)).unwrap();
        assert_eq!(json["code"], 1006);
        assert!(json.get("type").is_none());
    }
}
