//! Error taxonomy shared across the node.
//!
//! Kinds mirror how failures propagate: transport problems are retried once
//! and then surfaced; every protocol-level failure is attributed through the
//! blame model and returned inside an ordinary response; only invalid
//! requests and fatal conditions escape as errors from the facade.

use thiserror::Error;

/// Result alias used by the server facade.
pub type TssResult<T> = Result<T, TssError>;

#[derive(Debug, Error)]
pub enum TssError {
    /// Stream open or I/O failed after the single retry.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Not enough join-party intents arrived inside the window.
    #[error("join party did not complete in time")]
    JoinPartyTimeout,

    /// The elected leader never answered our join request.
    #[error("join party leader did not respond")]
    LeaderDidNotRespond,

    /// An MPC round did not complete inside the session window.
    #[error("protocol round did not complete in time")]
    ProtocolTimeout,

    /// The MPC library rejected a message from a party member.
    #[error("mpc library rejected a message: {0}")]
    Protocol(String),

    /// Broadcast acknowledgement hashes diverged for a round message.
    #[error("broadcast acknowledgement hashes diverged in round {0}")]
    BroadcastMismatch(String),

    /// Malformed session inputs or unknown participants. No blame.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Session cancelled by server shutdown.
    #[error("session cancelled by shutdown")]
    Cancelled,

    /// Unrecoverable condition: poisoned lock, disk failure, dead host.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Errors raised while converting between key encodings and peer ids.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("invalid bech32 public key {key}: {reason}")]
    InvalidPubKey { key: String, reason: String },

    #[error("peer id does not embed a secp256k1 public key")]
    NoEmbeddedKey,

    #[error("malformed peer id: {0}")]
    MalformedPeerId(String),

    #[error("public key {0} is not a member of the party")]
    NotAMember(String),
}

impl From<ConversionError> for TssError {
    fn from(e: ConversionError) -> Self {
        TssError::InvalidRequest(e.to_string())
    }
}
