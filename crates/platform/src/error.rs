//! Error types for wisp.
//!
//! Every error that reaches a caller or the `error` event carries enough
//! information to tell a retryable condition from a fatal one; see
//! [`WispError::level`].

use std::fmt;
use thiserror::Error;

/// Coarse classification attached to errors surfaced on the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorLevel {
    /// Socket-level failure (reset, refused, broken pipe).
    ClientSocket,
    /// Handshake or keepalive timeout.
    ClientTimeout,
    /// An authentication step failed locally, or all methods were exhausted.
    ClientAuthentication,
    /// Host name resolution failed.
    ClientDns,
    /// Malformed or unexpected protocol traffic.
    Protocol,
    /// The authentication agent was unreachable or misbehaved.
    Agent,
}

impl ErrorLevel {
    /// Returns the tag as it appears on the `error` event.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorLevel::ClientSocket => "client-socket",
            ErrorLevel::ClientTimeout => "client-timeout",
            ErrorLevel::ClientAuthentication => "client-authentication",
            ErrorLevel::ClientDns => "client-dns",
            ErrorLevel::Protocol => "protocol",
            ErrorLevel::Agent => "agent",
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for all wisp operations.
#[derive(Debug, Error)]
pub enum WispError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration, rejected before any I/O happens.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport socket failure.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Handshake or keepalive timeout.
    #[error("{0}")]
    Timeout(String),

    /// Authentication failure.
    #[error("{0}")]
    Authentication(String),

    /// Name resolution failure.
    #[error("{0}")]
    Dns(String),

    /// Protocol violation reported by the codec.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Agent failure.
    #[error("{0}")]
    Agent(String),

    /// The peer refused (or abandoned) a channel open.
    #[error("(SSH) Channel open failure: {description}")]
    ChannelOpen {
        /// Numeric reason code sent by the peer, if any.
        reason: Option<u32>,
        /// Human readable description.
        description: String,
        /// Language tag of the description.
        lang: String,
    },

    /// A request on an open channel was refused.
    #[error("{0}")]
    Channel(String),

    /// A connection-scoped request was refused.
    #[error("{0}")]
    Request(String),

    /// The connection went away before a reply arrived.
    #[error("No response from server")]
    Disconnected,

    /// The channel id space is exhausted.
    #[error("No free channels available")]
    NoFreeChannels,

    /// An operation was attempted without a writable connection.
    #[error("Not connected")]
    NotConnected,

    /// The peer does not support the requested extension.
    #[error("{0}")]
    Unsupported(String),
}

impl WispError {
    /// Returns the `level` tag for errors that are surfaced on the `error` event.
    pub fn level(&self) -> Option<ErrorLevel> {
        match self {
            WispError::Io(_) | WispError::Socket(_) => Some(ErrorLevel::ClientSocket),
            WispError::Timeout(_) => Some(ErrorLevel::ClientTimeout),
            WispError::Authentication(_) => Some(ErrorLevel::ClientAuthentication),
            WispError::Dns(_) => Some(ErrorLevel::ClientDns),
            WispError::Protocol(_) => Some(ErrorLevel::Protocol),
            WispError::Agent(_) => Some(ErrorLevel::Agent),
            _ => None,
        }
    }

    /// Returns true if the error terminates the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.level(),
            Some(ErrorLevel::ClientSocket)
                | Some(ErrorLevel::ClientTimeout)
                | Some(ErrorLevel::ClientDns)
                | Some(ErrorLevel::Protocol)
        )
    }

    /// Builds the error delivered when a channel open fails without a
    /// structured failure message.
    pub fn channel_closed_unexpectedly() -> Self {
        WispError::ChannelOpen {
            reason: None,
            description: "server closed channel unexpectedly".to_string(),
            lang: String::new(),
        }
    }
}

/// Result type for wisp operations
pub type WispResult<T> = Result<T, WispError>;
