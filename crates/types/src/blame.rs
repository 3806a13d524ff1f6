//! Blame model: deterministic attribution of session failures.

use serde::{Deserialize, Serialize};

use crate::identity::NodeIdentity;

/// Why a session failed, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// Peers never joined or never delivered an expected round message.
    TssTimeout,
    /// The elected join-party leader was unreachable.
    LeaderDidNotRespond,
    /// Broadcast acknowledgement hashes diverged.
    HashCheckFailed,
    /// The MPC library rejected a party's message.
    ProtocolError,
    /// The request itself was malformed.
    InvalidRequest,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailReason::TssTimeout => "tss_timeout",
            FailReason::LeaderDidNotRespond => "leader_did_not_respond",
            FailReason::HashCheckFailed => "hash_check_failed",
            FailReason::ProtocolError => "protocol_error",
            FailReason::InvalidRequest => "invalid_request",
        };
        f.write_str(s)
    }
}

/// One culpable peer with the evidence the reporter observed.
///
/// The signature is the reporter's, over the evidence bytes, so downstream
/// consumers can tell which node produced the attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameNode {
    pub pub_key: String,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl BlameNode {
    pub fn signed(identity: &NodeIdentity, pub_key: String, data: Vec<u8>) -> Self {
        let signature = identity.sign(&data);
        Self {
            pub_key,
            data,
            signature,
        }
    }
}

/// Attribution record attached to every failed response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blame {
    pub fail_reason: Option<FailReason>,
    /// Round tag in flight when the failure was observed, if any.
    pub round: String,
    pub culprits: Vec<BlameNode>,
    /// Whether the missing or offending messages were unicast.
    pub is_unicast: bool,
}

impl Blame {
    pub fn new(fail_reason: FailReason, round: impl Into<String>) -> Self {
        Self {
            fail_reason: Some(fail_reason),
            round: round.into(),
            culprits: Vec::new(),
            is_unicast: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fail_reason.is_none() && self.culprits.is_empty()
    }

    pub fn culprit_keys(&self) -> Vec<String> {
        self.culprits.iter().map(|c| c.pub_key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{node_identity_from_secret, verify_node_signature};

    #[test]
    fn test_fail_reason_rendering() {
        assert_eq!(FailReason::TssTimeout.to_string(), "tss_timeout");
        assert_eq!(
            FailReason::LeaderDidNotRespond.to_string(),
            "leader_did_not_respond"
        );
        let json = serde_json::to_string(&FailReason::HashCheckFailed).unwrap();
        assert_eq!(json, "\"hash_check_failed\"");
    }

    #[test]
    fn test_blame_node_evidence_is_signed() {
        let id = node_identity_from_secret(&[4u8; 32]).unwrap();
        let node = BlameNode::signed(&id, "culprit".to_string(), b"missing round kg-r2".to_vec());
        assert!(verify_node_signature(id.pub_key(), &node.data, &node.signature));
    }

    #[test]
    fn test_default_blame_is_empty() {
        let blame = Blame::default();
        assert!(blame.is_empty());
        let blame = Blame::new(FailReason::TssTimeout, "kg-r1");
        assert!(!blame.is_empty());
    }
}
