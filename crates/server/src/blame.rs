//! Blame attribution.
//!
//! Three failure modes produce blame: peers that never joined the party,
//! parties that went silent mid-protocol, and parties whose message the MPC
//! library rejected. Attribution is a pure function of what this node
//! observed, so nodes with the same trace produce the same culprit set; the
//! local node signs each piece of evidence so consumers know who reported it.

use std::collections::HashSet;
use std::sync::Arc;

use libp2p::PeerId;
use tracing::debug;

use tss_types::{
    peer_id_to_pub_key, Blame, BlameNode, FailReason, NodeIdentity, Party,
};

use crate::mpc::{MpcFailure, MpcUpdateError};

pub struct BlameManager {
    identity: Arc<NodeIdentity>,
}

impl BlameManager {
    pub fn new(identity: Arc<NodeIdentity>) -> Self {
        Self { identity }
    }

    fn culprit(&self, pub_key: String, evidence: Vec<u8>) -> BlameNode {
        BlameNode::signed(&self.identity, pub_key, evidence)
    }

    /// Join-party timeout: blame every expected peer that never sent intent.
    pub fn not_joined(
        &self,
        session_id: &str,
        expected_pub_keys: &[String],
        online: &[PeerId],
    ) -> Blame {
        let online_keys: HashSet<String> = online
            .iter()
            .filter_map(|p| peer_id_to_pub_key(p).ok())
            .collect();
        let mut blame = Blame::new(FailReason::TssTimeout, "");
        for key in expected_pub_keys {
            if !online_keys.contains(key) && key != self.identity.pub_key() {
                let evidence = format!("no join-party intent for session {session_id}");
                blame
                    .culprits
                    .push(self.culprit(key.clone(), evidence.into_bytes()));
            }
        }
        debug!(session = session_id, culprits = blame.culprits.len(), "join-party blame");
        blame
    }

    /// The elected leader never answered our join request.
    pub fn leader_unreachable(&self, session_id: &str, leader: PeerId) -> Blame {
        let mut blame = Blame::new(FailReason::LeaderDidNotRespond, "");
        if let Ok(key) = peer_id_to_pub_key(&leader) {
            let evidence = format!("leader did not respond for session {session_id}");
            blame.culprits.push(self.culprit(key, evidence.into_bytes()));
        }
        blame
    }

    /// Round timeout: blame the parties the library is still waiting on.
    pub fn round_timeout(
        &self,
        session_id: &str,
        party: &Party,
        awaiting: &[u16],
        is_unicast: bool,
    ) -> Blame {
        let mut blame = Blame::new(FailReason::TssTimeout, "");
        blame.is_unicast = is_unicast;
        for index in awaiting {
            if let Some(member) = party.member_at(*index) {
                let evidence = format!("round message never arrived in session {session_id}");
                blame
                    .culprits
                    .push(self.culprit(member.pub_key.clone(), evidence.into_bytes()));
            }
        }
        blame
    }

    /// The library rejected a message; its sender is the culprit and the
    /// library's evidence travels verbatim.
    pub fn update_error(&self, party: &Party, err: &MpcUpdateError) -> Blame {
        let mut blame = Blame::new(FailReason::ProtocolError, err.round.clone());
        blame.is_unicast = err.is_unicast;
        if let Some(member) = party.member_at(err.culprit_index) {
            blame
                .culprits
                .push(self.culprit(member.pub_key.clone(), err.evidence.clone()));
        }
        blame
    }

    /// Terminal failure reported by the library itself.
    pub fn mpc_failure(&self, party: &Party, failure: &MpcFailure) -> Blame {
        let mut blame = Blame::new(FailReason::ProtocolError, failure.round.clone());
        blame.is_unicast = failure.is_unicast;
        for index in &failure.culprit_indices {
            if let Some(member) = party.member_at(*index) {
                blame
                    .culprits
                    .push(self.culprit(member.pub_key.clone(), failure.evidence.clone()));
            }
        }
        blame
    }

    /// Broadcast confirmation hashes diverged; the broadcaster equivocated.
    pub fn broadcast_mismatch(&self, round: &str, culprit_pub_key: &str) -> Blame {
        let mut blame = Blame::new(FailReason::HashCheckFailed, round);
        let evidence = format!("broadcast acknowledgement hashes diverged in round {round}");
        blame
            .culprits
            .push(self.culprit(culprit_pub_key.to_string(), evidence.into_bytes()));
        blame
    }

    /// No signature arrived from any signer inside the notify window.
    pub fn signers_silent(&self, session_id: &str, signer_pub_keys: &[String]) -> Blame {
        let mut blame = Blame::new(FailReason::TssTimeout, "");
        for key in signer_pub_keys {
            if key != self.identity.pub_key() {
                let evidence = format!("no signature notification for session {session_id}");
                blame
                    .culprits
                    .push(self.culprit(key.clone(), evidence.into_bytes()));
            }
        }
        blame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tss_types::{node_identity_from_secret, verify_node_signature};

    fn identity(seed: u8) -> Arc<NodeIdentity> {
        let mut secret = [seed; 32];
        secret[0] = 1;
        Arc::new(node_identity_from_secret(&secret).unwrap())
    }

    fn party_of(ids: &[Arc<NodeIdentity>], local: &Arc<NodeIdentity>) -> Party {
        let keys: Vec<String> = ids.iter().map(|i| i.pub_key().to_string()).collect();
        Party::from_pub_keys(local.pub_key(), &keys, 1).unwrap()
    }

    #[test]
    fn test_not_joined_blames_only_absentees() {
        let ids: Vec<Arc<NodeIdentity>> = (80..84).map(identity).collect();
        let mgr = BlameManager::new(Arc::clone(&ids[0]));
        let keys: Vec<String> = ids.iter().map(|i| i.pub_key().to_string()).collect();

        // ids[3] never joined.
        let online: Vec<PeerId> = ids[..3].iter().map(|i| i.peer_id()).collect();
        let blame = mgr.not_joined("sess", &keys, &online);

        assert_eq!(blame.fail_reason, Some(FailReason::TssTimeout));
        assert_eq!(blame.culprit_keys(), vec![ids[3].pub_key().to_string()]);
        let culprit = &blame.culprits[0];
        assert!(verify_node_signature(
            ids[0].pub_key(),
            &culprit.data,
            &culprit.signature
        ));
    }

    #[test]
    fn test_round_timeout_maps_indices_to_keys() {
        let ids: Vec<Arc<NodeIdentity>> = (85..89).map(identity).collect();
        let mgr = BlameManager::new(Arc::clone(&ids[0]));
        let party = party_of(&ids, &ids[0]);

        let missing = vec![2u16];
        let blame = mgr.round_timeout("sess", &party, &missing, true);
        assert!(blame.is_unicast);
        assert_eq!(
            blame.culprit_keys(),
            vec![party.member_at(2).unwrap().pub_key.clone()]
        );
    }

    #[test]
    fn test_update_error_attributes_the_sender() {
        let ids: Vec<Arc<NodeIdentity>> = (90..93).map(identity).collect();
        let mgr = BlameManager::new(Arc::clone(&ids[0]));
        let party = party_of(&ids, &ids[0]);

        let err = MpcUpdateError {
            culprit_index: 1,
            round: "kg-r2".to_string(),
            reason: "reveal does not match commitment".to_string(),
            evidence: b"bad reveal".to_vec(),
            is_unicast: false,
        };
        let blame = mgr.update_error(&party, &err);
        assert_eq!(blame.fail_reason, Some(FailReason::ProtocolError));
        assert_eq!(blame.round, "kg-r2");
        assert_eq!(blame.culprits.len(), 1);
        // Evidence travels verbatim.
        assert_eq!(blame.culprits[0].data, b"bad reveal");
    }

    #[test]
    fn test_leader_unreachable_blames_the_leader() {
        let ids: Vec<Arc<NodeIdentity>> = (94..96).map(identity).collect();
        let mgr = BlameManager::new(Arc::clone(&ids[0]));
        let blame = mgr.leader_unreachable("sess", ids[1].peer_id());
        assert_eq!(blame.fail_reason, Some(FailReason::LeaderDidNotRespond));
        assert_eq!(blame.culprit_keys(), vec![ids[1].pub_key().to_string()]);
    }
}
