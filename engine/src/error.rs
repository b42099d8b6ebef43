//! Error types for the library seams.
//!
//! Buffer underrun/overrun and dropped packets are deliberately *not* errors:
//! the audio path absorbs them and only counts them.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The channel's socket could not be acquired. Fatal to that channel only.
    #[error("channel {channel}: cannot bind {addr}: {source}")]
    Bind {
        channel: usize,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("channel {channel}: receive failed: {source}")]
    Receive {
        channel: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum AdminError {
    /// Rejected before anything touches the network.
    #[error("{0}")]
    Validation(String),

    #[error("failed to send command to {target}: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server closed the session")]
    Closed,
}
