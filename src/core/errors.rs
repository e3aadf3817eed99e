// src/core/errors.rs

//! Defines the primary error type for the client.

use std::io::ErrorKind;
use std::sync::Arc;
use thiserror::Error;

/// Every failure a caller of the client can observe.
///
/// The variants fall into a few classes that drive the retry policy of the
/// connection layer:
/// - transport errors (`Io`, `ConnectionClosed`, `Timeout`) are retried,
/// - protocol errors (`Protocol`, `UnexpectedEof`) leave the socket unusable,
/// - application errors (`Server`, `TransactionAborted`, ...) are returned as-is.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Read timeout while waiting for response")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected end of stream inside a frame")]
    UnexpectedEof,

    #[error("{0}")]
    Server(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transaction aborted (WATCH failed)")]
    TransactionAborted,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Connection was closed by the client")]
    Closed,

    #[error("Client worker is no longer running")]
    WorkerGone,

    #[error("TLS Error: {0}")]
    Tls(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Returns true for failures of the underlying socket. These are the only
    /// errors the connection layer answers with a reconnect and a retry.
    pub fn is_transport(&self) -> bool {
        match self {
            ClientError::Io(e) => !matches!(
                e.kind(),
                ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::Unsupported
            ),
            ClientError::ConnectionClosed | ClientError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true when the byte stream can no longer be trusted to be
    /// aligned on a frame boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Protocol(_) | ClientError::UnexpectedEof)
    }

    /// Returns true when the subscriber should reconnect and resubscribe
    /// instead of giving up.
    pub fn is_recoverable(&self) -> bool {
        self.is_transport() || self.is_fatal()
    }

    /// The leading error code of a server error reply, e.g. `WRONGTYPE` or `ERR`.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Server(msg) | ClientError::Auth(msg) => msg.split_whitespace().next(),
            _ => None,
        }
    }
}

impl PartialEq for ClientError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClientError::Io(e1), ClientError::Io(e2)) => e1.kind() == e2.kind(),
            (ClientError::Protocol(s1), ClientError::Protocol(s2)) => s1 == s2,
            (ClientError::Server(s1), ClientError::Server(s2)) => s1 == s2,
            (ClientError::Auth(s1), ClientError::Auth(s2)) => s1 == s2,
            (ClientError::UnexpectedReply(s1), ClientError::UnexpectedReply(s2)) => s1 == s2,
            (ClientError::Tls(s1), ClientError::Tls(s2)) => s1 == s2,
            (ClientError::InvalidConfig(s1), ClientError::InvalidConfig(s2)) => s1 == s2,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

impl From<tokio::time::error::Elapsed> for ClientError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClientError::Timeout
    }
}

impl From<rustls::Error> for ClientError {
    fn from(e: rustls::Error) -> Self {
        ClientError::Tls(e.to_string())
    }
}
