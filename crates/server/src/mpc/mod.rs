//! Contract with the external MPC round library.
//!
//! The cryptographic round functions live outside this repository; the
//! session engine only sees this interface. A party exposes three producer
//! queues (outgoing round messages, the terminal outcome, and attributable
//! failures) plus a synchronous `update` for inbound messages. Cancellation
//! is the engine's stop signal, never a channel close on these queues.

pub mod simulation;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;
use tss_types::WireMessage;

/// Paillier safe-prime material generated at boot or supplied externally.
///
/// The contents are the library's business; this layer only checks internal
/// consistency before accepting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreParams {
    pub material: String,
    pub checksum: String,
}

impl PreParams {
    pub fn validate(&self) -> bool {
        !self.material.is_empty()
            && self.checksum == hex::encode(sha2::Sha256::digest(self.material.as_bytes()))
    }
}

#[derive(Debug, Error)]
pub enum MpcError {
    #[error("pre-parameter generation failed: {0}")]
    PreParams(String),

    #[error("party construction failed: {0}")]
    Construction(String),

    #[error("party already started")]
    AlreadyStarted,
}

/// `update` rejection: the message from `culprit_index` broke the protocol.
#[derive(Debug, Clone)]
pub struct MpcUpdateError {
    pub culprit_index: u16,
    pub round: String,
    pub reason: String,
    /// Library-supplied evidence (e.g. a failed proof), attached verbatim.
    pub evidence: Vec<u8>,
    pub is_unicast: bool,
}

/// Terminal failure reported on the failures queue.
#[derive(Debug, Clone)]
pub struct MpcFailure {
    pub round: String,
    pub culprit_indices: Vec<u16>,
    pub reason: String,
    pub evidence: Vec<u8>,
    pub is_unicast: bool,
}

/// Successful keygen output.
#[derive(Debug, Clone)]
pub struct KeygenOutcome {
    /// Compressed secp256k1 pool public key.
    pub pub_key: Vec<u8>,
    /// The library's opaque serialized share.
    pub save_data: String,
}

/// One signature produced by a keysign run.
#[derive(Debug, Clone)]
pub struct MpcSignature {
    pub msg_hash: Vec<u8>,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
    pub recovery_id: u8,
}

/// Successful keysign output, one signature per requested hash.
#[derive(Debug, Clone)]
pub struct KeysignOutcome {
    pub signatures: Vec<MpcSignature>,
}

#[derive(Debug, Clone)]
pub enum MpcOutcome {
    Keygen(KeygenOutcome),
    Keysign(KeysignOutcome),
}

/// The three producer queues the engine selects over.
pub struct PartyChannels {
    pub outgoing: async_channel::Receiver<WireMessage>,
    pub finished: async_channel::Receiver<MpcOutcome>,
    pub failures: async_channel::Receiver<MpcFailure>,
}

/// One running MPC party.
pub trait MpcParty: Send + Sync {
    /// Begin round one; emits the first outgoing messages.
    fn start(&self) -> Result<(), MpcError>;

    /// Feed one validated inbound round message to the library.
    /// An error attributes the failure to the message's sender.
    fn update(&self, message: WireMessage) -> Result<(), MpcUpdateError>;

    /// Party indices the library is still waiting on, for timeout blame.
    fn awaiting_from(&self) -> Vec<u16>;

    /// Whether the currently awaited round travels by unicast.
    fn expecting_unicast(&self) -> bool;
}

/// Keygen party construction parameters.
pub struct KeygenPartyArgs {
    /// Lexicographically ordered party public keys.
    pub party_pub_keys: Vec<String>,
    pub local_index: u16,
    pub threshold: u16,
    pub pre_params: PreParams,
}

/// Keysign party construction parameters.
pub struct SignPartyArgs {
    /// The saved share from keygen.
    pub save_data: String,
    /// Lexicographically ordered signer public keys.
    pub party_pub_keys: Vec<String>,
    pub local_index: u16,
    pub threshold: u16,
    /// 32-byte hashes to sign, sorted for cross-node determinism.
    pub msg_hashes: Vec<Vec<u8>>,
}

/// Factory for parties and pre-parameters; the external library's entry
/// point as seen by the server.
pub trait MpcFactory: Send + Sync + 'static {
    fn generate_pre_params(&self, timeout: Duration) -> Result<PreParams, MpcError>;

    fn keygen_party(
        &self,
        args: KeygenPartyArgs,
    ) -> Result<(Box<dyn MpcParty>, PartyChannels), MpcError>;

    fn sign_party(
        &self,
        args: SignPartyArgs,
    ) -> Result<(Box<dyn MpcParty>, PartyChannels), MpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_params_validation() {
        let material = "abcdef".to_string();
        let good = PreParams {
            checksum: hex::encode(sha2::Sha256::digest(material.as_bytes())),
            material,
        };
        assert!(good.validate());

        let mut bad = good.clone();
        bad.material = "tampered".to_string();
        assert!(!bad.validate());

        let empty = PreParams {
            material: String::new(),
            checksum: String::new(),
        };
        assert!(!empty.validate());
    }
}
