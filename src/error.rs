//! Error types for the TFTP server

use crate::wire::ErrorCode;
use thiserror::Error;

/// Result type for TFTP operations
pub type Result<T> = std::result::Result<T, TftpError>;

/// Errors surfaced by the server, its transfers, and the packet codec
#[derive(Error, Debug)]
pub enum TftpError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A datagram that could not be decoded as a TFTP packet
    #[error("malformed packet: {message}")]
    MalformedPacket { message: String },

    /// The peer stopped answering; every retransmission timed out
    #[error("peer did not respond after {attempts} attempts")]
    PeerUnresponsive { attempts: u32 },

    /// The peer ended the transfer with an ERROR packet
    #[error("peer error {code}: {message}")]
    Peer { code: ErrorCode, message: String },

    /// The peer sent something the protocol does not allow here
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The transfer was already finished or aborted
    #[error("transfer is closed")]
    Closed,
}

impl TftpError {
    /// Create a malformed-packet error
    pub fn malformed(message: impl Into<String>) -> Self {
        TftpError::MalformedPacket {
            message: message.into(),
        }
    }

    /// Create a protocol-violation error
    pub fn protocol(message: impl Into<String>) -> Self {
        TftpError::Protocol {
            message: message.into(),
        }
    }

    /// Create a peer error from a received ERROR packet
    pub fn peer(code: ErrorCode, message: impl Into<String>) -> Self {
        TftpError::Peer {
            code,
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        TftpError::Config {
            message: message.into(),
        }
    }

    /// Check whether the peer is gone rather than misbehaving.
    ///
    /// Aborting such a transfer must not emit an ERROR packet: either
    /// nobody is listening or the peer already sent its own ERROR.
    pub fn is_peer_gone(&self) -> bool {
        matches!(
            self,
            TftpError::PeerUnresponsive { .. } | TftpError::Peer { .. }
        )
    }

    /// Check whether this error came from a received ERROR packet
    pub fn is_peer_error(&self) -> bool {
        matches!(self, TftpError::Peer { .. })
    }
}
