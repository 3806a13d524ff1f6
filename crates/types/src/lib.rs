//! Shared type layer for the TSS node.
//!
//! Everything that crosses a crate boundary lives here: node identities and
//! their bech32/PeerId conversions, deterministic session ids, the framed
//! wire model spoken on every protocol stream, the blame model, the error
//! taxonomy, and the immutable runtime configuration.

pub mod blame;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod msg_id;
pub mod requests;
pub mod version;

pub use blame::{Blame, BlameNode, FailReason};
pub use config::TssConfig;
pub use error::{ConversionError, TssError, TssResult};
pub use identity::{
    account_prefix, bech32_to_pub_key, choose_leader, get_threshold, node_identity_from_secret,
    peer_id_to_pub_key, peer_ids_from_pub_keys, pick_lexicographic, pub_key_to_bech32,
    pub_key_to_peer_id, setup_bech32_prefix, verify_node_signature, NodeIdentity, Party,
    PartyMember,
};
pub use message::{
    ConfirmMessage, Envelope, JoinPartyLeaderMsg, JoinPartyLeaderRequest,
    JoinPartyLeaderResponse, JoinPartyRequestMsg, KeysignSignatureMsg, MsgAck, ReasonCode,
    SignatureRecord, TssPayload, TssProtocol, WireMessage, MAX_FRAME_BYTES,
};
pub use msg_id::{keygen_msg_id, keysign_msg_id, msg_to_hash_string};
pub use requests::{KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse, Status};
pub use version::{is_older_than, NEW_JOIN_PARTY_VERSION};
