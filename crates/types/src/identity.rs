//! Node identities and the bech32 / PeerId bijection.
//!
//! A node is identified at the application layer by the bech32 rendering of
//! its compressed secp256k1 public key and at the transport layer by the
//! libp2p `PeerId` derived from the same key material. secp256k1 keys are
//! small enough that the PeerId embeds them in an identity multihash, so the
//! two representations convert in both directions without lookup tables.

use std::sync::OnceLock;

use bech32::{Bech32, Hrp};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::ecdsa::signature::{Signer, Verifier};
use libp2p::identity;
use libp2p::PeerId;
use sha2::{Digest, Sha256};

use crate::error::ConversionError;

/// Human-readable part used when no prefix was configured explicitly.
const DEFAULT_ACCOUNT_PREFIX: &str = "tsspub";

static ACCOUNT_PREFIX: OnceLock<String> = OnceLock::new();

/// Configure the bech32 account prefix for this process.
///
/// Idempotent: the first caller wins and later calls (including calls with a
/// different prefix) are ignored. The server constructor calls this before
/// any key is rendered, so every component observes the same prefix.
pub fn setup_bech32_prefix(prefix: &str) {
    let _ = ACCOUNT_PREFIX.set(prefix.to_string());
}

/// The prefix in effect, falling back to the default when none was set.
pub fn account_prefix() -> &'static str {
    ACCOUNT_PREFIX.get().map(String::as_str).unwrap_or(DEFAULT_ACCOUNT_PREFIX)
}

/// Honest-majority threshold for a pool of `n` parties: signing needs t+1.
pub fn get_threshold(n: usize) -> usize {
    n.saturating_sub(1) / 2
}

/// Render a compressed secp256k1 public key as a bech32 string.
pub fn pub_key_to_bech32(pub_key: &[u8]) -> Result<String, ConversionError> {
    if pub_key.len() != 33 {
        return Err(ConversionError::InvalidPubKey {
            key: hex::encode(pub_key),
            reason: format!("expected 33 bytes, got {}", pub_key.len()),
        });
    }
    let hrp = Hrp::parse(account_prefix()).map_err(|e| ConversionError::InvalidPubKey {
        key: hex::encode(pub_key),
        reason: format!("bad prefix: {e}"),
    })?;
    bech32::encode::<Bech32>(hrp, pub_key).map_err(|e| ConversionError::InvalidPubKey {
        key: hex::encode(pub_key),
        reason: e.to_string(),
    })
}

/// Decode a bech32 public key back to its 33 compressed bytes.
///
/// The key must carry the configured prefix and parse as a secp256k1 point.
pub fn bech32_to_pub_key(encoded: &str) -> Result<Vec<u8>, ConversionError> {
    let (hrp, data) = bech32::decode(encoded).map_err(|e| ConversionError::InvalidPubKey {
        key: encoded.to_string(),
        reason: e.to_string(),
    })?;
    if hrp.as_str() != account_prefix() {
        return Err(ConversionError::InvalidPubKey {
            key: encoded.to_string(),
            reason: format!("prefix {} does not match {}", hrp, account_prefix()),
        });
    }
    VerifyingKey::from_sec1_bytes(&data).map_err(|e| ConversionError::InvalidPubKey {
        key: encoded.to_string(),
        reason: format!("not a secp256k1 point: {e}"),
    })?;
    Ok(data)
}

/// Transport identity for a bech32 public key.
pub fn pub_key_to_peer_id(encoded: &str) -> Result<PeerId, ConversionError> {
    let raw = bech32_to_pub_key(encoded)?;
    let secp =
        identity::secp256k1::PublicKey::try_from_bytes(&raw).map_err(|e| {
            ConversionError::InvalidPubKey {
                key: encoded.to_string(),
                reason: e.to_string(),
            }
        })?;
    let public: identity::PublicKey = secp.into();
    Ok(PeerId::from_public_key(&public))
}

/// Application identity for a transport peer.
///
/// Works for every peer in this network because secp256k1 public keys are
/// inlined into the PeerId multihash.
pub fn peer_id_to_pub_key(peer: &PeerId) -> Result<String, ConversionError> {
    let mh = multihash::Multihash::<64>::from_bytes(&peer.to_bytes())
        .map_err(|e| ConversionError::MalformedPeerId(e.to_string()))?;
    // 0x00 is the identity multihash code; anything else was hashed and the
    // key bytes are unrecoverable.
    if mh.code() != 0x00 {
        return Err(ConversionError::NoEmbeddedKey);
    }
    let public = identity::PublicKey::try_decode_protobuf(mh.digest())
        .map_err(|_| ConversionError::NoEmbeddedKey)?;
    let secp = public
        .try_into_secp256k1()
        .map_err(|_| ConversionError::NoEmbeddedKey)?;
    pub_key_to_bech32(&secp.to_bytes())
}

/// Batch conversion preserving input order.
pub fn peer_ids_from_pub_keys(pub_keys: &[String]) -> Result<Vec<PeerId>, ConversionError> {
    pub_keys.iter().map(|pk| pub_key_to_peer_id(pk)).collect()
}

/// Everything a node needs to speak for itself: the raw secret, the libp2p
/// keypair derived from it, and the matching bech32/PeerId identities.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: identity::Keypair,
    signing_key: SigningKey,
    pub_key: String,
    peer_id: PeerId,
}

impl NodeIdentity {
    pub fn keypair(&self) -> &identity::Keypair {
        &self.keypair
    }

    pub fn pub_key(&self) -> &str {
        &self.pub_key
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Deterministic (RFC6979) signature over `data`, 64-byte fixed encoding.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing_key.sign(data);
        sig.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("pub_key", &self.pub_key)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

/// Build a node identity from a 32-byte secp256k1 secret.
pub fn node_identity_from_secret(secret: &[u8]) -> Result<NodeIdentity, ConversionError> {
    let mut raw = secret.to_vec();
    let secp_secret = identity::secp256k1::SecretKey::try_from_bytes(&mut raw).map_err(|e| {
        ConversionError::InvalidPubKey {
            key: "<secret>".to_string(),
            reason: e.to_string(),
        }
    })?;
    let signing_key =
        SigningKey::from_slice(secret).map_err(|e| ConversionError::InvalidPubKey {
            key: "<secret>".to_string(),
            reason: e.to_string(),
        })?;
    let keypair: identity::Keypair = identity::secp256k1::Keypair::from(secp_secret).into();
    let public = keypair.public();
    let peer_id = PeerId::from_public_key(&public);
    let secp_pub = public
        .try_into_secp256k1()
        .map_err(|_| ConversionError::NoEmbeddedKey)?;
    let pub_key = pub_key_to_bech32(&secp_pub.to_bytes())?;
    Ok(NodeIdentity {
        keypair,
        signing_key,
        pub_key,
        peer_id,
    })
}

/// Verify a 64-byte signature produced by [`NodeIdentity::sign`].
pub fn verify_node_signature(pub_key: &str, data: &[u8], signature: &[u8]) -> bool {
    let Ok(raw) = bech32_to_pub_key(pub_key) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_sec1_bytes(&raw) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(data, &sig).is_ok()
}

/// One member of a formed party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyMember {
    pub pub_key: String,
    pub peer_id: PeerId,
}

/// The ordered set of peers executing one session.
///
/// Members are sorted by the lexicographic order of their PeerId renderings,
/// which fixes party indices identically on every honest node without a
/// separate agreement round.
#[derive(Debug, Clone)]
pub struct Party {
    members: Vec<PartyMember>,
    local_index: u16,
    threshold: u16,
}

impl Party {
    /// Build the ordered party from bech32 public keys.
    ///
    /// `local_pub_key` must be one of `pub_keys`.
    pub fn from_pub_keys(
        local_pub_key: &str,
        pub_keys: &[String],
        threshold: u16,
    ) -> Result<Self, ConversionError> {
        let mut members = pub_keys
            .iter()
            .map(|pk| {
                Ok(PartyMember {
                    pub_key: pk.clone(),
                    peer_id: pub_key_to_peer_id(pk)?,
                })
            })
            .collect::<Result<Vec<_>, ConversionError>>()?;
        members.sort_by(|a, b| a.peer_id.to_string().cmp(&b.peer_id.to_string()));
        members.dedup_by(|a, b| a.pub_key == b.pub_key);
        let local_index = members
            .iter()
            .position(|m| m.pub_key == local_pub_key)
            .ok_or_else(|| ConversionError::NotAMember(local_pub_key.to_string()))?
            as u16;
        Ok(Self {
            members,
            local_index,
            threshold,
        })
    }

    pub fn members(&self) -> &[PartyMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn local_index(&self) -> u16 {
        self.local_index
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn pub_keys(&self) -> Vec<String> {
        self.members.iter().map(|m| m.pub_key.clone()).collect()
    }

    pub fn contains_pub_key(&self, pub_key: &str) -> bool {
        self.members.iter().any(|m| m.pub_key == pub_key)
    }

    pub fn index_of(&self, pub_key: &str) -> Option<u16> {
        self.members
            .iter()
            .position(|m| m.pub_key == pub_key)
            .map(|i| i as u16)
    }

    pub fn member_at(&self, index: u16) -> Option<&PartyMember> {
        self.members.get(index as usize)
    }

    /// Every member except the local node, for fan-out.
    pub fn remote_members(&self) -> impl Iterator<Item = &PartyMember> {
        let local = self.local_index as usize;
        self.members
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != local)
            .map(|(_, m)| m)
    }
}

/// Deterministic leader election for the leader-based join-party variant.
///
/// The leader is the peer whose id digests smallest when hashed together
/// with the session id and block height. Every honest node computes the
/// same answer from the same inputs.
pub fn choose_leader(session_id: &str, block_height: i64, peers: &[PeerId]) -> Option<PeerId> {
    peers
        .iter()
        .min_by_key(|peer| {
            let mut hasher = Sha256::new();
            hasher.update(peer.to_bytes());
            hasher.update(session_id.as_bytes());
            hasher.update(block_height.to_be_bytes());
            let digest: [u8; 32] = hasher.finalize().into();
            digest
        })
        .copied()
}

/// Sort peers lexicographically and keep the first `count`.
///
/// This is the tie-break applied whenever more peers show up than a party
/// needs; applying it unconditionally keeps the chosen set identical across
/// nodes that observed the same intents.
pub fn pick_lexicographic(peers: &[PeerId], count: usize) -> Vec<PeerId> {
    let mut sorted: Vec<PeerId> = peers.to_vec();
    sorted.sort_by_key(|p| p.to_string());
    sorted.dedup();
    sorted.truncate(count);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(seed: u8) -> NodeIdentity {
        let mut secret = [seed; 32];
        secret[0] = 1; // keep the scalar in range
        node_identity_from_secret(&secret).unwrap()
    }

    #[test]
    fn test_pub_key_round_trip() {
        let id = test_identity(7);
        let raw = bech32_to_pub_key(id.pub_key()).unwrap();
        assert_eq!(raw.len(), 33);
        assert_eq!(pub_key_to_bech32(&raw).unwrap(), id.pub_key());
    }

    #[test]
    fn test_peer_id_bijection() {
        let id = test_identity(9);
        let peer = pub_key_to_peer_id(id.pub_key()).unwrap();
        assert_eq!(peer, id.peer_id());
        let back = peer_id_to_pub_key(&peer).unwrap();
        assert_eq!(back, id.pub_key());
    }

    #[test]
    fn test_party_order_is_deterministic() {
        let ids: Vec<NodeIdentity> = (1..=4).map(test_identity).collect();
        let keys: Vec<String> = ids.iter().map(|i| i.pub_key().to_string()).collect();

        let mut shuffled = keys.clone();
        shuffled.reverse();

        let a = Party::from_pub_keys(&keys[0], &keys, 1).unwrap();
        let b = Party::from_pub_keys(&keys[0], &shuffled, 1).unwrap();
        assert_eq!(a.pub_keys(), b.pub_keys());

        // Every node computes the same index for the same member.
        let c = Party::from_pub_keys(&keys[2], &keys, 1).unwrap();
        assert_eq!(a.index_of(&keys[2]), Some(c.local_index()));
    }

    #[test]
    fn test_party_rejects_non_member() {
        let ids: Vec<NodeIdentity> = (1..=3).map(test_identity).collect();
        let keys: Vec<String> = ids.iter().skip(1).map(|i| i.pub_key().to_string()).collect();
        let res = Party::from_pub_keys(ids[0].pub_key(), &keys, 1);
        assert!(matches!(res, Err(ConversionError::NotAMember(_))));
    }

    #[test]
    fn test_leader_choice_is_stable() {
        let peers: Vec<PeerId> = (1..=4).map(|s| test_identity(s).peer_id()).collect();
        let mut reversed = peers.clone();
        reversed.reverse();
        let a = choose_leader("abc", 42, &peers).unwrap();
        let b = choose_leader("abc", 42, &reversed).unwrap();
        assert_eq!(a, b);
        // A different block height may move the leader, but stays stable.
        let c = choose_leader("abc", 43, &peers).unwrap();
        let d = choose_leader("abc", 43, &reversed).unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn test_signature_verifies() {
        let id = test_identity(5);
        let sig = id.sign(b"evidence");
        assert!(verify_node_signature(id.pub_key(), b"evidence", &sig));
        assert!(!verify_node_signature(id.pub_key(), b"tampered", &sig));
    }

    #[test]
    fn test_threshold_needs_majority() {
        assert_eq!(get_threshold(4), 1);
        assert_eq!(get_threshold(3), 1);
        assert_eq!(get_threshold(2), 0);
        assert_eq!(get_threshold(1), 0);
    }
}
