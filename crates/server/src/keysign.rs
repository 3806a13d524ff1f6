//! Keysign flow.
//!
//! A node in the signer list joins the party and, if chosen, runs the
//! signing rounds; chosen signers then push the result to the rest of the
//! pool. A node outside the signer list (or one that joined but was not
//! chosen) waits on the signature notifier instead. Identical requests
//! submitted concurrently attach to the first run and share its response.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use libp2p::PeerId;
use tokio::sync::broadcast;
use tracing::{info, warn};

use tss_network::JoinPartyFailure;
use tss_types::{
    get_threshold, keysign_msg_id, peer_id_to_pub_key, pub_key_to_peer_id, Blame, FailReason,
    KeysignRequest, KeysignResponse, Party, SignatureRecord, TssError, TssResult,
};

use crate::mpc::{MpcOutcome, SignPartyArgs};
use crate::notifier::records_from_signatures;
use crate::session::{SessionEngine, SessionState};
use crate::TssServer;

impl TssServer {
    pub(crate) async fn run_keysign_deduplicated(
        &self,
        req: KeysignRequest,
    ) -> TssResult<KeysignResponse> {
        let msg_id = keysign_msg_id(&req.messages, &req.signer_pub_keys);

        enum Role {
            Runner(broadcast::Sender<KeysignResponse>),
            Waiter(broadcast::Receiver<KeysignResponse>),
        }
        let role = {
            let mut inflight = self.inflight_keysigns.lock().await;
            match inflight.get(&msg_id) {
                Some(tx) => Role::Waiter(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(msg_id.clone(), tx.clone());
                    Role::Runner(tx)
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                info!(session = %msg_id, "identical keysign in flight, sharing its result");
                rx.recv().await.map_err(|_| {
                    TssError::InvalidRequest(
                        "identical in-flight keysign ended without a result".to_string(),
                    )
                })
            }
            Role::Runner(tx) => {
                let started = std::time::Instant::now();
                let result = self.keysign_inner(&req, &msg_id).await;
                self.inflight_keysigns.lock().await.remove(&msg_id);
                let label = match &result {
                    Ok(resp) if resp.status == tss_types::Status::Success => "success",
                    Ok(_) => "fail",
                    Err(_) => "error",
                };
                self.monitor.record_keysign(label, started.elapsed());
                if let Ok(resp) = &result {
                    let _ = tx.send(resp.clone());
                }
                result
            }
        }
    }

    async fn keysign_inner(&self, req: &KeysignRequest, msg_id: &str) -> TssResult<KeysignResponse> {
        let msg_hashes = decode_messages(&req.messages)?;
        if req.signer_pub_keys.is_empty() {
            return Err(TssError::InvalidRequest("no signers named".to_string()));
        }

        let local_key = self.identity.pub_key().to_string();
        let is_signer = req.signer_pub_keys.contains(&local_key);

        // The local share tells us the pool membership and threshold.
        let local_state = match self.state_mgr.get_local_state(&req.pool_pub_key) {
            Ok(state) => Some(state),
            Err(_) if is_signer => {
                return Err(TssError::InvalidRequest(format!(
                    "no local share for pool key {}",
                    req.pool_pub_key
                )));
            }
            Err(_) => None,
        };

        if let Some(state) = &local_state {
            let pool: HashSet<&String> = state.participant_keys.iter().collect();
            if let Some(unknown) = req.signer_pub_keys.iter().find(|k| !pool.contains(k)) {
                return Err(TssError::InvalidRequest(format!(
                    "signer {unknown} is not a member of the pool"
                )));
            }
        }

        info!(session = %msg_id, state = %SessionState::New, messages = req.messages.len(), "keysign requested");

        // Keysigns share the lock; only keygen excludes them.
        let _shared = self.keygen_lock.read().await;

        // Subscribe before doing anything else so a fast signer cannot
        // notify us before we are listening.
        self.notifier
            .subscribe(msg_id, &req.pool_pub_key, &msg_hashes)
            .await;

        let response = if !is_signer {
            self.await_notified(msg_id, &req.signer_pub_keys).await
        } else {
            let state = local_state.as_ref().ok_or_else(|| {
                TssError::InvalidRequest("signer path requires a local share".to_string())
            })?;
            self.sign_as_party_member(req, msg_id, &msg_hashes, state)
                .await
        };
        self.notifier.unsubscribe(msg_id).await;
        response
    }

    /// Non-signer path: the signature arrives via the notifier or not at all.
    async fn await_notified(
        &self,
        msg_id: &str,
        signer_pub_keys: &[String],
    ) -> TssResult<KeysignResponse> {
        info!(session = %msg_id, "not a signer, waiting for the signature notification");
        match self.notifier.wait(msg_id, self.conf.sig_notify_timeout).await {
            Some(records) => Ok(KeysignResponse::success(records)),
            None => {
                // Non-fatal on the signer side; for this caller the window
                // closed without a verifying signature.
                let blame = self.blame.signers_silent(msg_id, signer_pub_keys);
                Ok(KeysignResponse::fail(blame))
            }
        }
    }

    async fn sign_as_party_member(
        &self,
        req: &KeysignRequest,
        msg_id: &str,
        msg_hashes: &[Vec<u8>],
        local_state: &tss_storage::KeygenLocalState,
    ) -> TssResult<KeysignResponse> {
        let pool_size = local_state.participant_keys.len();
        let threshold = get_threshold(pool_size);
        if req.signer_pub_keys.len() < threshold + 1 {
            return Err(TssError::InvalidRequest(format!(
                "{} signers named, {} required",
                req.signer_pub_keys.len(),
                threshold + 1
            )));
        }

        info!(session = %msg_id, state = %SessionState::Joining, "forming signing party");
        let outcome = match self
            .join_party(
                msg_id,
                &req.version,
                req.block_height,
                &req.signer_pub_keys,
                threshold,
            )
            .await?
        {
            Ok(outcome) => outcome,
            Err(JoinPartyFailure::Timeout { online, .. }) => {
                warn!(session = %msg_id, state = %SessionState::TimedOut, "party formation timed out");
                let blame = self.blame.not_joined(msg_id, &req.signer_pub_keys, &online);
                return Ok(KeysignResponse::fail(blame));
            }
            Err(JoinPartyFailure::LeaderNotResponding { leader }) => {
                warn!(session = %msg_id, state = %SessionState::TimedOut, "join party leader did not respond");
                let blame = self.blame.leader_unreachable(msg_id, leader);
                return Ok(KeysignResponse::fail(blame));
            }
            Err(JoinPartyFailure::Network(e)) => {
                return Err(TssError::Transport(e.to_string()));
            }
        };

        let local_peer = self.identity.peer_id();
        if !outcome.chosen.contains(&local_peer) {
            info!(session = %msg_id, "not among the chosen signers");
            return self.await_notified(msg_id, &req.signer_pub_keys).await;
        }

        let chosen_keys = outcome
            .chosen
            .iter()
            .map(peer_id_to_pub_key)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TssError::from)?;
        let party =
            Party::from_pub_keys(self.identity.pub_key(), &chosen_keys, threshold as u16)?;
        let handle = self
            .router
            .register(msg_id, party.clone())
            .await
            .map_err(|e| TssError::InvalidRequest(e.to_string()))?;
        info!(
            session = %msg_id,
            signers = party.len(),
            local_index = party.local_index(),
            "signing party formed, running rounds"
        );

        let (mpc_party, channels) = self
            .factory
            .sign_party(SignPartyArgs {
                save_data: local_state.local_party_save_data.clone(),
                party_pub_keys: party.pub_keys(),
                local_index: party.local_index(),
                threshold: threshold as u16,
                msg_hashes: msg_hashes.to_vec(),
            })
            .map_err(|e| TssError::InvalidRequest(e.to_string()))?;

        let engine = SessionEngine::new(
            msg_id.to_string(),
            party.clone(),
            handle,
            mpc_party,
            channels,
            self.conf.keysign_timeout,
            self.stop_signal(),
        );

        match engine.run(&self.blame).await {
            Ok(MpcOutcome::Keysign(outcome)) => {
                let records = records_from_signatures(&outcome.signatures);
                self.notify_non_signers(msg_id, req, &party, &records).await;
                info!(session = %msg_id, signatures = records.len(), "keysign complete");
                Ok(KeysignResponse::success(records))
            }
            Ok(MpcOutcome::Keygen(_)) => Err(TssError::Fatal(
                "mpc library returned a keygen outcome for a keysign session".to_string(),
            )),
            Err((TssError::Cancelled, _)) => Err(TssError::Cancelled),
            Err((TssError::Fatal(e), _)) => Err(TssError::Fatal(e)),
            Err((err, mut blame)) => {
                if blame.is_empty() {
                    blame = Blame::new(FailReason::TssTimeout, "");
                }
                warn!(session = %msg_id, "keysign failed: {err}");
                Ok(KeysignResponse::fail(blame))
            }
        }
    }

    /// Push the finished signatures to every pool member outside the
    /// signing party.
    async fn notify_non_signers(
        &self,
        msg_id: &str,
        req: &KeysignRequest,
        party: &Party,
        records: &[SignatureRecord],
    ) {
        let Ok(state) = self.state_mgr.get_local_state(&req.pool_pub_key) else {
            return;
        };
        let recipients: Vec<PeerId> = state
            .participant_keys
            .iter()
            .filter(|key| !party.contains_pub_key(key))
            .filter_map(|key| pub_key_to_peer_id(key).ok())
            .collect();
        self.notifier
            .broadcast_signatures(msg_id, &req.pool_pub_key, &recipients, records)
            .await;
    }
}

/// Base64-decode and sort the request's message hashes.
///
/// Sorting fixes the signing order across nodes regardless of how the
/// caller ordered the request.
fn decode_messages(messages: &[String]) -> TssResult<Vec<Vec<u8>>> {
    if messages.is_empty() {
        return Err(TssError::InvalidRequest("no messages to sign".to_string()));
    }
    let mut hashes = messages
        .iter()
        .map(|m| {
            let bytes = BASE64
                .decode(m)
                .map_err(|e| TssError::InvalidRequest(format!("message is not base64: {e}")))?;
            if bytes.len() != 32 {
                return Err(TssError::InvalidRequest(format!(
                    "message hash must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
            Ok(bytes)
        })
        .collect::<TssResult<Vec<_>>>()?;
    hashes.sort();
    hashes.dedup();
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_decode_messages_sorts_and_dedups() {
        let h1 = Sha256::digest(b"m1").to_vec();
        let h2 = Sha256::digest(b"m2").to_vec();
        let encoded = vec![
            BASE64.encode(&h2),
            BASE64.encode(&h1),
            BASE64.encode(&h2),
        ];
        let decoded = decode_messages(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0] < decoded[1]);
    }

    #[test]
    fn test_decode_messages_rejects_bad_input() {
        assert!(decode_messages(&[]).is_err());
        assert!(decode_messages(&["@@@".to_string()]).is_err());
        assert!(decode_messages(&[BASE64.encode(b"short")]).is_err());
    }
}
