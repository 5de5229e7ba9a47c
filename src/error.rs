//! Error types

use std::net::SocketAddr;

/// Session, pairing and startup errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local UDP listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// WebSocket handshake with the tunnel endpoint failed
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// The tunnel session terminated
    #[error("Tunnel session closed")]
    SessionClosed,

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound queue rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Queue at capacity; the message was dropped
    #[error("outbound queue full")]
    QueueFull,

    /// The session is gone
    #[error("session closed")]
    Closed,
}
