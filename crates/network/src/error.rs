//! Network-layer error types.

use libp2p::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to reach peer {peer}: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    #[error("peer {peer} marked unresponsive for session {session_id}")]
    PeerUnresponsive { peer: PeerId, session_id: String },

    #[error("transport host is shutting down")]
    HostClosed,

    #[error("invalid multiaddr {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("session {0} is already registered")]
    SessionExists(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("join party did not complete: {0}")]
    JoinParty(String),

    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("internal channel closed")]
    ChannelClosed,
}

pub type NetworkResult<T> = Result<T, NetworkError>;
