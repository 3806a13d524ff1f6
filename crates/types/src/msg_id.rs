//! Deterministic session ids.
//!
//! Two honest nodes given the same request bytes must derive byte-identical
//! session ids, so every derivation sorts its inputs before hashing.

use sha2::{Digest, Sha256};

/// Hex sha256 of arbitrary request bytes.
pub fn msg_to_hash_string(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Session id of a keygen request: hash over the sorted participant keys.
pub fn keygen_msg_id(keys: &[String]) -> String {
    let mut sorted = keys.to_vec();
    sorted.sort();
    msg_to_hash_string(sorted.concat().as_bytes())
}

/// Session id of a keysign request: sorted messages joined by commas,
/// concatenated with the sorted signer keys.
pub fn keysign_msg_id(messages: &[String], signer_pub_keys: &[String]) -> String {
    let mut sorted_msgs = messages.to_vec();
    sorted_msgs.sort();
    let mut data = sorted_msgs.join(",").into_bytes();

    let mut sorted_keys = signer_pub_keys.to_vec();
    sorted_keys.sort();
    data.extend_from_slice(sorted_keys.concat().as_bytes());

    msg_to_hash_string(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_id_ignores_key_order() {
        let keys = vec!["kb".to_string(), "ka".to_string(), "kc".to_string()];
        let mut reversed = keys.clone();
        reversed.reverse();
        assert_eq!(keygen_msg_id(&keys), keygen_msg_id(&reversed));
    }

    #[test]
    fn test_keysign_id_ignores_permutations() {
        let msgs = vec!["m2".to_string(), "m1".to_string()];
        let keys = vec!["kb".to_string(), "ka".to_string()];
        let id = keysign_msg_id(&msgs, &keys);
        assert_eq!(
            id,
            keysign_msg_id(
                &["m1".to_string(), "m2".to_string()],
                &["ka".to_string(), "kb".to_string()]
            )
        );
    }

    #[test]
    fn test_different_inputs_differ() {
        let keys = vec!["ka".to_string(), "kb".to_string()];
        assert_ne!(
            keygen_msg_id(&keys),
            keygen_msg_id(&["ka".to_string(), "kc".to_string()])
        );
        assert_ne!(
            keysign_msg_id(&["m1".to_string()], &keys),
            keysign_msg_id(&["m2".to_string()], &keys)
        );
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let id = msg_to_hash_string(b"abc");
        assert_eq!(id.len(), 64);
        assert_eq!(
            id,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
