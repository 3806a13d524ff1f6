//! Signature notifier.
//!
//! After a keysign, the signers push the finished signature set to every
//! pool member that did not sign, over the dedicated notifier protocol.
//! Non-signers subscribe before their request starts so no notification can
//! race past them. The first verifying signature per message hash is final;
//! later arrivals are ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use libp2p::PeerId;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, trace, warn};

use tss_network::Communication;
use tss_types::{
    bech32_to_pub_key, peer_id_to_pub_key, Envelope, KeysignSignatureMsg, NodeIdentity,
    SignatureRecord, TssProtocol,
};

use crate::mpc::MpcSignature;

struct WaiterState {
    pool_pub_key: String,
    expected: Vec<Vec<u8>>,
    accepted: Mutex<HashMap<Vec<u8>, SignatureRecord>>,
    complete: Notify,
}

/// Fans finished signatures out to non-signers and collects them on the
/// receiving side.
pub struct SignatureNotifier {
    comm: Arc<Communication>,
    identity: Arc<NodeIdentity>,
    waiters: Mutex<HashMap<String, Arc<WaiterState>>>,
}

impl SignatureNotifier {
    pub fn spawn(
        comm: Arc<Communication>,
        identity: Arc<NodeIdentity>,
        mut notifier_rx: mpsc::Receiver<(PeerId, Envelope)>,
    ) -> Arc<Self> {
        let notifier = Arc::new(Self {
            comm,
            identity,
            waiters: Mutex::new(HashMap::new()),
        });

        let inbound = Arc::clone(&notifier);
        tokio::spawn(async move {
            while let Some((peer, envelope)) = notifier_rx.recv().await {
                inbound.handle_envelope(peer, envelope).await;
            }
        });

        notifier
    }

    /// Register interest in a session's signatures. Must be called before
    /// the request is initiated so early notifications are not lost.
    pub async fn subscribe(&self, session_id: &str, pool_pub_key: &str, msg_hashes: &[Vec<u8>]) {
        let state = Arc::new(WaiterState {
            pool_pub_key: pool_pub_key.to_string(),
            expected: msg_hashes.to_vec(),
            accepted: Mutex::new(HashMap::new()),
            complete: Notify::new(),
        });
        self.waiters
            .lock()
            .await
            .insert(session_id.to_string(), state);
    }

    pub async fn unsubscribe(&self, session_id: &str) {
        self.waiters.lock().await.remove(session_id);
    }

    /// Wait until a verifying signature arrived for every expected hash, or
    /// the window closes. Returns records in the expected-hash order.
    pub async fn wait(&self, session_id: &str, timeout: Duration) -> Option<Vec<SignatureRecord>> {
        let state = self.waiters.lock().await.get(session_id).cloned()?;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            {
                let accepted = state.accepted.lock().await;
                if state.expected.iter().all(|h| accepted.contains_key(h)) {
                    let records = state
                        .expected
                        .iter()
                        .filter_map(|h| accepted.get(h).cloned())
                        .collect();
                    return Some(records);
                }
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(session = session_id, "no complete signature set inside the notify window");
                    return None;
                }
                _ = state.complete.notified() => {}
            }
        }
    }

    /// Push the signature set to every non-signer of the pool.
    pub async fn broadcast_signatures(
        &self,
        session_id: &str,
        pool_pub_key: &str,
        recipients: &[PeerId],
        signatures: &[SignatureRecord],
    ) {
        if recipients.is_empty() {
            return;
        }
        let msg = KeysignSignatureMsg {
            session_id: session_id.to_string(),
            pool_pub_key: pool_pub_key.to_string(),
            signatures: signatures.to_vec(),
        };
        let Ok(payload) = serde_json::to_vec(&msg) else {
            return;
        };
        let envelope = Envelope::new(
            session_id,
            TssProtocol::SignatureNotifier,
            self.identity.pub_key(),
            payload,
        );
        info!(
            session = session_id,
            recipients = recipients.len(),
            "notifying non-signers"
        );
        for (peer, result) in self
            .comm
            .send_to_many(recipients, TssProtocol::SignatureNotifier, &envelope)
            .await
        {
            if let Err(e) = result {
                debug!(%peer, session = session_id, "signature notification not delivered: {e}");
            }
        }
    }

    async fn handle_envelope(&self, peer: PeerId, envelope: Envelope) {
        let matches = peer_id_to_pub_key(&peer)
            .map(|pk| pk == envelope.from_peer_pub_key)
            .unwrap_or(false);
        if !matches {
            trace!(%peer, "notifier envelope identity mismatch");
            return;
        }
        let msg: KeysignSignatureMsg = match serde_json::from_slice(&envelope.payload) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let state = {
            let waiters = self.waiters.lock().await;
            waiters.get(&msg.session_id).cloned()
        };
        let Some(state) = state else {
            trace!(session = %msg.session_id, "notification for a session we are not waiting on");
            return;
        };
        if msg.pool_pub_key != state.pool_pub_key {
            warn!(session = %msg.session_id, "notification names a different pool key");
            return;
        }

        let mut accepted = state.accepted.lock().await;
        for record in msg.signatures {
            let Some(hash) = verify_record(&state.pool_pub_key, &record) else {
                warn!(session = %msg.session_id, "signature record failed verification");
                continue;
            };
            if !state.expected.iter().any(|h| *h == hash) {
                continue;
            }
            // First verifying copy wins.
            accepted.entry(hash).or_insert(record);
        }
        let complete = state.expected.iter().all(|h| accepted.contains_key(h));
        drop(accepted);
        if complete {
            state.complete.notify_one();
        }
    }
}

/// Check one record against the pool key; returns the message hash it
/// covers when the signature verifies.
fn verify_record(pool_pub_key: &str, record: &SignatureRecord) -> Option<Vec<u8>> {
    let msg_hash = BASE64.decode(&record.msg).ok()?;
    let r = BASE64.decode(&record.r).ok()?;
    let s = BASE64.decode(&record.s).ok()?;
    let recovery = BASE64.decode(&record.recovery_id).ok()?;
    if recovery.len() != 1 || recovery[0] > 3 {
        return None;
    }
    let mut raw = r;
    raw.extend_from_slice(&s);
    let signature = Signature::from_slice(&raw).ok()?;
    let key_bytes = bech32_to_pub_key(pool_pub_key).ok()?;
    let verifying = VerifyingKey::from_sec1_bytes(&key_bytes).ok()?;
    verifying.verify_prehash(&msg_hash, &signature).ok()?;
    Some(msg_hash)
}

/// Transport encoding of the library's signatures.
pub fn records_from_signatures(signatures: &[MpcSignature]) -> Vec<SignatureRecord> {
    signatures
        .iter()
        .map(|sig| SignatureRecord {
            msg: BASE64.encode(&sig.msg_hash),
            r: BASE64.encode(&sig.r),
            s: BASE64.encode(&sig.s),
            recovery_id: BASE64.encode([sig.recovery_id]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use sha2::{Digest, Sha256};
    use tss_types::pub_key_to_bech32;

    fn pool_and_record(msg: &[u8]) -> (String, SignatureRecord) {
        let signing = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let hash = Sha256::digest(msg).to_vec();
        let (signature, recovery_id) = signing.sign_prehash_recoverable(&hash).unwrap();
        let sig = MpcSignature {
            msg_hash: hash,
            r: signature.r().to_bytes().to_vec(),
            s: signature.s().to_bytes().to_vec(),
            recovery_id: recovery_id.to_byte(),
        };
        let pool = pub_key_to_bech32(
            &VerifyingKey::from(&signing)
                .to_sec1_bytes(),
        )
        .unwrap();
        (pool, records_from_signatures(&[sig]).remove(0))
    }

    #[test]
    fn test_verify_record_accepts_valid_signature() {
        let (pool, record) = pool_and_record(b"hello");
        let hash = verify_record(&pool, &record).unwrap();
        assert_eq!(hash, Sha256::digest(b"hello").to_vec());
    }

    #[test]
    fn test_verify_record_rejects_tampered_signature() {
        let (pool, mut record) = pool_and_record(b"hello");
        record.msg = BASE64.encode(Sha256::digest(b"other"));
        assert!(verify_record(&pool, &record).is_none());
    }

    #[test]
    fn test_verify_record_rejects_wrong_pool_key() {
        let (_, record) = pool_and_record(b"hello");
        let other = SigningKey::from_slice(&[9u8; 32]).unwrap();
        let other_pool = pub_key_to_bech32(
            &VerifyingKey::from(&other)
                .to_sec1_bytes(),
        )
        .unwrap();
        assert!(verify_record(&other_pool, &record).is_none());
    }
}
