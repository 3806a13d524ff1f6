//! Keygen flow.

use tracing::{info, warn};

use tss_network::JoinPartyFailure;
use tss_storage::KeygenLocalState;
use tss_types::{
    get_threshold, keygen_msg_id, pub_key_to_bech32, Blame, FailReason, KeygenRequest,
    KeygenResponse, Party, TssError, TssResult,
};

use crate::mpc::{KeygenPartyArgs, MpcOutcome};
use crate::session::{SessionEngine, SessionState};
use crate::TssServer;

impl TssServer {
    /// Jointly generate a pool key with every peer named in the request.
    ///
    /// Serialized against other keygens (and excluding keysigns) by the
    /// exclusive side of the keygen lock.
    pub(crate) async fn run_keygen(&self, req: KeygenRequest) -> TssResult<KeygenResponse> {
        let started = std::time::Instant::now();
        let result = self.keygen_inner(&req).await;
        let label = match &result {
            Ok(resp) if resp.status == tss_types::Status::Success => "success",
            Ok(_) => "fail",
            Err(_) => "error",
        };
        self.monitor.record_keygen(label, started.elapsed());
        result
    }

    async fn keygen_inner(&self, req: &KeygenRequest) -> TssResult<KeygenResponse> {
        if req.keys.len() < 2 {
            return Err(TssError::InvalidRequest(
                "keygen needs at least two participants".to_string(),
            ));
        }
        if !req.keys.iter().any(|k| k == self.identity.pub_key()) {
            return Err(TssError::InvalidRequest(
                "local node is not among the keygen participants".to_string(),
            ));
        }

        let _exclusive = self.keygen_lock.write().await;

        let msg_id = keygen_msg_id(&req.keys);
        info!(session = %msg_id, state = %SessionState::New, participants = req.keys.len(), "keygen requested");

        // Keygen requires the full participant set, so the join threshold
        // is n-1: formation succeeds only when everyone shows up.
        let join_threshold = req.keys.len() - 1;
        info!(session = %msg_id, state = %SessionState::Joining, "forming party");
        let outcome = match self
            .join_party(&msg_id, &req.version, req.block_height, &req.keys, join_threshold)
            .await?
        {
            Ok(outcome) => outcome,
            Err(JoinPartyFailure::Timeout { online, mismatched }) => {
                if !mismatched.is_empty() {
                    warn!(session = %msg_id, "peers disagreed on the participant list during join");
                }
                warn!(session = %msg_id, state = %SessionState::TimedOut, "party formation timed out");
                let blame = self.blame.not_joined(&msg_id, &req.keys, &online);
                return Ok(KeygenResponse::fail(blame));
            }
            Err(JoinPartyFailure::LeaderNotResponding { leader }) => {
                warn!(session = %msg_id, state = %SessionState::TimedOut, "join party leader did not respond");
                let blame = self.blame.leader_unreachable(&msg_id, leader);
                return Ok(KeygenResponse::fail(blame));
            }
            Err(JoinPartyFailure::Network(e)) => {
                return Err(TssError::Transport(e.to_string()));
            }
        };

        let threshold = get_threshold(req.keys.len()) as u16;
        let party = Party::from_pub_keys(self.identity.pub_key(), &req.keys, threshold)?;
        let handle = self
            .router
            .register(&msg_id, party.clone())
            .await
            .map_err(|e| TssError::InvalidRequest(e.to_string()))?;
        info!(
            session = %msg_id,
            joined = outcome.online.len(),
            local_index = party.local_index(),
            "party formed, running keygen rounds"
        );

        let (mpc_party, channels) = self
            .factory
            .keygen_party(KeygenPartyArgs {
                party_pub_keys: party.pub_keys(),
                local_index: party.local_index(),
                threshold,
                pre_params: self.pre_params.clone(),
            })
            .map_err(|e| TssError::Fatal(e.to_string()))?;

        let engine = SessionEngine::new(
            msg_id.clone(),
            party.clone(),
            handle,
            mpc_party,
            channels,
            self.conf.keygen_timeout,
            self.stop_signal(),
        );

        match engine.run(&self.blame).await {
            Ok(MpcOutcome::Keygen(outcome)) => {
                let pool_pub_key = pub_key_to_bech32(&outcome.pub_key)?;
                let state = KeygenLocalState {
                    local_party_save_data: outcome.save_data,
                    participant_keys: party.pub_keys(),
                    local_party_key: self.identity.pub_key().to_string(),
                };
                // Write-once: an existing share for this key survives as-is
                // and its path is returned.
                let path = self
                    .state_mgr
                    .save_local_state(&pool_pub_key, &state)
                    .map_err(|e| TssError::Fatal(e.to_string()))?;
                info!(session = %msg_id, pool_pub_key, "keygen complete");
                Ok(KeygenResponse::success(
                    pool_pub_key,
                    path.display().to_string(),
                ))
            }
            Ok(MpcOutcome::Keysign(_)) => Err(TssError::Fatal(
                "mpc library returned a keysign outcome for a keygen session".to_string(),
            )),
            Err((TssError::Cancelled, _)) => Err(TssError::Cancelled),
            Err((TssError::Fatal(e), _)) => Err(TssError::Fatal(e)),
            Err((err, mut blame)) => {
                if blame.is_empty() {
                    // Property: every failed response names at least the
                    // reason even when no peer is attributable.
                    blame = Blame::new(FailReason::TssTimeout, "");
                }
                warn!(session = %msg_id, "keygen failed: {err}");
                Ok(KeygenResponse::fail(blame))
            }
        }
    }
}
