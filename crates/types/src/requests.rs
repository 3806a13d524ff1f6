//! Facade request and response types.

use serde::{Deserialize, Serialize};

use crate::blame::Blame;
use crate::message::SignatureRecord;

/// Terminal status of a facade operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Fail,
}

/// Request to jointly generate a key with the given participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenRequest {
    /// Bech32 public keys of every participant, local node included.
    pub keys: Vec<String>,
    pub block_height: i64,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenResponse {
    /// Bech32 public key of the generated pool key, empty on failure.
    pub pub_key: String,
    /// Where the local share was persisted, empty on failure.
    pub path: String,
    pub status: Status,
    pub blame: Blame,
}

impl KeygenResponse {
    pub fn success(pub_key: String, path: String) -> Self {
        Self {
            pub_key,
            path,
            status: Status::Success,
            blame: Blame::default(),
        }
    }

    pub fn fail(blame: Blame) -> Self {
        Self {
            pub_key: String::new(),
            path: String::new(),
            status: Status::Fail,
            blame,
        }
    }
}

/// Request to jointly sign one or more message hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignRequest {
    /// Bech32 public key produced by an earlier keygen.
    pub pool_pub_key: String,
    /// Base64-encoded 32-byte hashes to sign.
    pub messages: Vec<String>,
    /// Eligible signers for this request.
    pub signer_pub_keys: Vec<String>,
    pub block_height: i64,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub signatures: Vec<SignatureRecord>,
    pub status: Status,
    pub blame: Blame,
}

impl KeysignResponse {
    pub fn success(signatures: Vec<SignatureRecord>) -> Self {
        Self {
            signatures,
            status: Status::Success,
            blame: Blame::default(),
        }
    }

    pub fn fail(blame: Blame) -> Self {
        Self {
            signatures: Vec::new(),
            status: Status::Fail,
            blame,
        }
    }
}
