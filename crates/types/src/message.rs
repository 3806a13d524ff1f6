//! Framed wire model.
//!
//! Every frame on every protocol stream is a length-prefixed [`Envelope`];
//! the envelope payload is the JSON encoding of the per-protocol message
//! type. Recipients answer each frame with a small [`MsgAck`] so senders can
//! confirm delivery and retry once on transient failure.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::NodeIdentity;

/// Hard cap on a single frame, payload included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// The four multiplexed protocols spoken between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TssProtocol {
    JoinParty,
    JoinPartyLeader,
    Tss,
    SignatureNotifier,
}

impl TssProtocol {
    pub const fn id(&self) -> &'static str {
        match self {
            TssProtocol::JoinParty => "/p2p/join-party/0.2.0",
            TssProtocol::JoinPartyLeader => "/p2p/join-party-leader/0.1.0",
            TssProtocol::Tss => "/p2p/tss/0.1.0",
            TssProtocol::SignatureNotifier => "/p2p/signature-notifier/0.1.0",
        }
    }
}

impl std::fmt::Display for TssProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Framed envelope carried by every protocol stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: String,
    pub protocol_id: String,
    pub from_peer_pub_key: String,
    pub payload_len: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(
        session_id: impl Into<String>,
        protocol: TssProtocol,
        from_peer_pub_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            protocol_id: protocol.id().to_string(),
            from_peer_pub_key: from_peer_pub_key.into(),
            payload_len: payload.len() as u32,
            payload,
        }
    }

    /// Internal consistency of the frame; a failed check drops it silently.
    pub fn is_well_formed(&self) -> bool {
        self.payload.len() == self.payload_len as usize
            && self.payload.len() <= MAX_FRAME_BYTES
            && !self.session_id.is_empty()
            && !self.from_peer_pub_key.is_empty()
    }
}

/// Receipt acknowledgement for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgAck {
    Received,
}

/// Leaderless join-party intent, re-broadcast until the party forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPartyRequestMsg {
    pub session_id: String,
    /// The full participant set the sender expects, as peer id strings.
    pub peer_ids: Vec<String>,
}

/// Follower-to-leader join request, signed by the follower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPartyLeaderRequest {
    pub session_id: String,
    pub block_height: i64,
    pub peer_ids: Vec<String>,
    pub threshold: u16,
    pub signature: Vec<u8>,
}

impl JoinPartyLeaderRequest {
    /// Bytes covered by the follower signature.
    pub fn signable_bytes(
        session_id: &str,
        block_height: i64,
        peer_ids: &[String],
        threshold: u16,
    ) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"join-party-leader-request");
        hasher.update(session_id.as_bytes());
        hasher.update(block_height.to_be_bytes());
        hasher.update(peer_ids.join(",").as_bytes());
        hasher.update(threshold.to_be_bytes());
        hasher.finalize().to_vec()
    }

    pub fn signed(
        identity: &NodeIdentity,
        session_id: String,
        block_height: i64,
        peer_ids: Vec<String>,
        threshold: u16,
    ) -> Self {
        let digest = Self::signable_bytes(&session_id, block_height, &peer_ids, threshold);
        let signature = identity.sign(&digest);
        Self {
            session_id,
            block_height,
            peer_ids,
            threshold,
            signature,
        }
    }
}

/// Outcome codes a leader can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Success,
    Timeout,
}

/// Leader's selection broadcast, signed by the leader.
///
/// On `Timeout` the peer list carries whoever did join, so followers can
/// attribute blame to the absentees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPartyLeaderResponse {
    pub session_id: String,
    pub reason_code: ReasonCode,
    pub chosen_peers: Vec<String>,
    pub signature: Vec<u8>,
}

impl JoinPartyLeaderResponse {
    pub fn signable_bytes(
        session_id: &str,
        reason_code: ReasonCode,
        chosen_peers: &[String],
    ) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"join-party-leader-response");
        hasher.update(session_id.as_bytes());
        hasher.update(match reason_code {
            ReasonCode::Success => b"success".as_slice(),
            ReasonCode::Timeout => b"timeout".as_slice(),
        });
        hasher.update(chosen_peers.join(",").as_bytes());
        hasher.finalize().to_vec()
    }

    pub fn signed(
        identity: &NodeIdentity,
        session_id: String,
        reason_code: ReasonCode,
        chosen_peers: Vec<String>,
    ) -> Self {
        let digest = Self::signable_bytes(&session_id, reason_code, &chosen_peers);
        let signature = identity.sign(&digest);
        Self {
            session_id,
            reason_code,
            chosen_peers,
            signature,
        }
    }
}

/// Messages inside the join-party-leader envelope payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JoinPartyLeaderMsg {
    Request(JoinPartyLeaderRequest),
    Response(JoinPartyLeaderResponse),
}

/// One round datum emitted by the MPC library, as serialized on the wire.
///
/// The session id travels in the envelope; party indices refer to the
/// lexicographic party ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub round: String,
    pub from_party_index: u16,
    /// `None` for broadcasts.
    pub to_party_indices: Option<Vec<u16>>,
    pub is_broadcast: bool,
    pub is_to_old_and_new_committees: bool,
    pub wire_bytes: Vec<u8>,
}

impl WireMessage {
    /// Hash echoed in broadcast confirmations.
    pub fn payload_hash(&self) -> String {
        hex::encode(Sha256::digest(&self.wire_bytes))
    }
}

/// Broadcast confirmation: "I saw this payload from this sender".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmMessage {
    pub round: String,
    /// Public key of the original broadcaster.
    pub broadcaster: String,
    /// Hex sha256 of the payload the confirmer received.
    pub payload_hash: String,
}

/// Messages inside the tss envelope payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TssPayload {
    Wire(WireMessage),
    Confirm(ConfirmMessage),
}

/// One finished signature, base64-encoded for transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// The signed message hash.
    pub msg: String,
    pub r: String,
    pub s: String,
    pub recovery_id: String,
}

/// Signature fan-out from signers to the rest of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignSignatureMsg {
    pub session_id: String,
    pub pool_pub_key: String,
    pub signatures: Vec<SignatureRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{node_identity_from_secret, verify_node_signature};

    fn identity() -> NodeIdentity {
        node_identity_from_secret(&[3u8; 32]).unwrap()
    }

    #[test]
    fn test_envelope_well_formedness() {
        let env = Envelope::new("abc", TssProtocol::Tss, "pk", vec![1, 2, 3]);
        assert!(env.is_well_formed());
        assert_eq!(env.protocol_id, "/p2p/tss/0.1.0");

        let mut bad = env.clone();
        bad.payload_len = 2;
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn test_leader_response_signature_covers_selection() {
        let id = identity();
        let resp = JoinPartyLeaderResponse::signed(
            &id,
            "sess".to_string(),
            ReasonCode::Success,
            vec!["p1".to_string(), "p2".to_string()],
        );
        let digest = JoinPartyLeaderResponse::signable_bytes(
            &resp.session_id,
            resp.reason_code,
            &resp.chosen_peers,
        );
        assert!(verify_node_signature(id.pub_key(), &digest, &resp.signature));

        // A tampered peer list no longer verifies.
        let tampered = JoinPartyLeaderResponse::signable_bytes(
            &resp.session_id,
            resp.reason_code,
            &["p1".to_string()],
        );
        assert!(!verify_node_signature(id.pub_key(), &tampered, &resp.signature));
    }

    #[test]
    fn test_wire_message_hash_tracks_payload() {
        let msg = WireMessage {
            round: "kg-r1".to_string(),
            from_party_index: 0,
            to_party_indices: None,
            is_broadcast: true,
            is_to_old_and_new_committees: false,
            wire_bytes: vec![9, 9, 9],
        };
        let mut other = msg.clone();
        other.wire_bytes = vec![9, 9, 8];
        assert_ne!(msg.payload_hash(), other.payload_hash());
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = TssPayload::Confirm(ConfirmMessage {
            round: "kg-r2".to_string(),
            broadcaster: "pk".to_string(),
            payload_hash: "aa".to_string(),
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let restored: TssPayload = serde_json::from_slice(&bytes).unwrap();
        match restored {
            TssPayload::Confirm(c) => assert_eq!(c.round, "kg-r2"),
            _ => panic!("expected confirm"),
        }
    }
}
