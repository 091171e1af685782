//! Peer-wire protocol: handshake, message framing, and the per-peer
//! connection state machine (§4.4).
use thiserror::Error;

pub mod connection;
pub mod handshake;
pub mod message;

pub use connection::{PeerCommand, PeerConnection, PeerEvent, PeerSession};
pub use handshake::Handshake;
pub use message::PeerMessage;

/// Errors scoped to a single peer connection. None of these affect other
/// peers or the torrent as a whole (§7) — the orchestrator just drops the
/// session.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake protocol identifier invalid")]
    InvalidProtocol,

    #[error("handshake info-hash mismatch")]
    InfoHashMismatch,

    #[error("connect/handshake timed out")]
    HandshakeTimeout,

    #[error("idle timeout waiting for a message")]
    IdleTimeout,

    #[error("frame length {0} exceeds safe upper bound")]
    OversizeFrame(u32),

    #[error("malformed message payload for id {0}")]
    MalformedPayload(u8),

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
