//! Simulated MPC backend.
//!
//! Drives the same round shapes as the real GG20 library (commitment
//! broadcast, reveal broadcast, unicast exchange) with hash chains instead
//! of Paillier arithmetic, and derives the pool key deterministically from
//! the participant set. Every party computes the same key and the same
//! RFC6979 signatures, so multi-node runs converge without shared state.
//!
//! This backend provides NO secrecy: the pool secret is derivable from
//! public inputs. It exists to exercise coordination, routing, blame and
//! storage end to end; production deployments plug the real round library
//! into the same [`MpcFactory`] contract.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use tss_types::WireMessage;

use super::{
    KeygenOutcome, KeygenPartyArgs, KeysignOutcome, MpcError, MpcFactory, MpcOutcome, MpcParty,
    MpcSignature, MpcUpdateError, PartyChannels, PreParams, SignPartyArgs,
};

const KEYGEN_ROUNDS: [&str; 3] = ["kg-r1", "kg-r2", "kg-r3"];
const KEYSIGN_ROUNDS: [&str; 3] = ["ks-r1", "ks-r2", "ks-r3"];

/// The share blob this backend stores via the state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimulatedSaveData {
    group_entropy: String,
    secret: String,
    pub_key: String,
}

/// Factory for simulated parties.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMpc {
    /// Broadcast a reveal that does not match our commitment, to exercise
    /// the protocol-error blame path.
    invalid_reveal: bool,
}

impl SimulatedMpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// A misbehaving instance whose round-two reveal fails verification.
    pub fn with_invalid_reveal() -> Self {
        Self {
            invalid_reveal: true,
        }
    }
}

impl MpcFactory for SimulatedMpc {
    fn generate_pre_params(&self, _timeout: Duration) -> Result<PreParams, MpcError> {
        let mut material = [0u8; 48];
        rand::rngs::OsRng.fill_bytes(&mut material);
        let material = hex::encode(material);
        let checksum = hex::encode(Sha256::digest(material.as_bytes()));
        Ok(PreParams { material, checksum })
    }

    fn keygen_party(
        &self,
        args: KeygenPartyArgs,
    ) -> Result<(Box<dyn MpcParty>, PartyChannels), MpcError> {
        if !args.pre_params.validate() {
            return Err(MpcError::Construction("invalid pre-parameters".to_string()));
        }
        if args.local_index as usize >= args.party_pub_keys.len() {
            return Err(MpcError::Construction("local index out of range".to_string()));
        }
        let mut entropy = Sha256::new();
        entropy.update(b"sim-keygen");
        for key in &args.party_pub_keys {
            entropy.update(key.as_bytes());
        }
        Ok(SimulatedParty::new(
            PartyKind::Keygen,
            entropy.finalize().to_vec(),
            args.party_pub_keys.len() as u16,
            args.local_index,
            self.invalid_reveal,
        ))
    }

    fn sign_party(
        &self,
        args: SignPartyArgs,
    ) -> Result<(Box<dyn MpcParty>, PartyChannels), MpcError> {
        let save: SimulatedSaveData = serde_json::from_str(&args.save_data)
            .map_err(|e| MpcError::Construction(format!("unreadable save data: {e}")))?;
        let secret = hex::decode(&save.secret)
            .map_err(|e| MpcError::Construction(format!("bad secret encoding: {e}")))?;
        if args.local_index as usize >= args.party_pub_keys.len() {
            return Err(MpcError::Construction("local index out of range".to_string()));
        }
        if args.msg_hashes.is_empty() {
            return Err(MpcError::Construction("no messages to sign".to_string()));
        }
        let mut entropy = Sha256::new();
        entropy.update(b"sim-keysign");
        entropy.update(save.group_entropy.as_bytes());
        for key in &args.party_pub_keys {
            entropy.update(key.as_bytes());
        }
        for hash in &args.msg_hashes {
            entropy.update(hash);
        }
        Ok(SimulatedParty::new(
            PartyKind::Keysign {
                secret,
                msg_hashes: args.msg_hashes,
            },
            entropy.finalize().to_vec(),
            args.party_pub_keys.len() as u16,
            args.local_index,
            self.invalid_reveal,
        ))
    }
}

enum PartyKind {
    Keygen,
    Keysign {
        secret: Vec<u8>,
        msg_hashes: Vec<Vec<u8>>,
    },
}

/// Which message each round carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Commit,
    Reveal,
    Exchange,
    Done,
}

struct Tracking {
    phase: Phase,
    commits: HashMap<u16, Vec<u8>>,
    reveals: HashMap<u16, Vec<u8>>,
    exchanged: HashSet<u16>,
}

struct Inner {
    kind: PartyKind,
    entropy: Vec<u8>,
    n: u16,
    local_index: u16,
    rounds: [&'static str; 3],
    invalid_reveal: bool,
    started: AtomicBool,
    tracking: Mutex<Tracking>,
    out_tx: async_channel::Sender<WireMessage>,
    fin_tx: async_channel::Sender<MpcOutcome>,
    fail_tx: async_channel::Sender<super::MpcFailure>,
}

struct SimulatedParty(Inner);

impl SimulatedParty {
    #[allow(clippy::new_ret_no_self)]
    fn new(
        kind: PartyKind,
        entropy: Vec<u8>,
        n: u16,
        local_index: u16,
        invalid_reveal: bool,
    ) -> (Box<dyn MpcParty>, PartyChannels) {
        let (out_tx, outgoing) = async_channel::bounded(4 * n as usize + 8);
        let (fin_tx, finished) = async_channel::bounded(1);
        let (fail_tx, failures) = async_channel::bounded(4);
        let rounds = match kind {
            PartyKind::Keygen => KEYGEN_ROUNDS,
            PartyKind::Keysign { .. } => KEYSIGN_ROUNDS,
        };
        let party = Self(Inner {
            kind,
            entropy,
            n,
            local_index,
            rounds,
            invalid_reveal,
            started: AtomicBool::new(false),
            tracking: Mutex::new(Tracking {
                phase: Phase::Commit,
                commits: HashMap::new(),
                reveals: HashMap::new(),
                exchanged: HashSet::new(),
            }),
            out_tx,
            fin_tx,
            fail_tx,
        });
        (
            Box::new(party),
            PartyChannels {
                outgoing,
                finished,
                failures,
            },
        )
    }
}

impl Inner {
    fn reveal_for(&self, index: u16) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"reveal");
        hasher.update(&self.entropy);
        hasher.update(index.to_be_bytes());
        hasher.finalize().to_vec()
    }

    fn commit_for(&self, index: u16) -> Vec<u8> {
        Sha256::digest(self.reveal_for(index)).to_vec()
    }

    fn exchange_for(&self, from: u16, to: u16) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"exchange");
        hasher.update(&self.entropy);
        hasher.update(from.to_be_bytes());
        hasher.update(to.to_be_bytes());
        hasher.finalize().to_vec()
    }

    fn emit(&self, round: &str, to: Option<Vec<u16>>, bytes: Vec<u8>) {
        let message = WireMessage {
            round: round.to_string(),
            from_party_index: self.local_index,
            is_broadcast: to.is_none(),
            to_party_indices: to,
            is_to_old_and_new_committees: false,
            wire_bytes: bytes,
        };
        if self.out_tx.try_send(message).is_err() {
            warn!(round, "outgoing queue rejected a round message");
        }
    }

    fn emit_commit(&self) {
        self.emit(self.rounds[0], None, self.commit_for(self.local_index));
    }

    fn emit_reveal(&self) {
        let reveal = if self.invalid_reveal {
            let mut hasher = Sha256::new();
            hasher.update(b"bogus-reveal");
            hasher.update(&self.entropy);
            hasher.finalize().to_vec()
        } else {
            self.reveal_for(self.local_index)
        };
        self.emit(self.rounds[1], None, reveal);
    }

    fn emit_exchanges(&self) {
        for to in 0..self.n {
            if to != self.local_index {
                self.emit(
                    self.rounds[2],
                    Some(vec![to]),
                    self.exchange_for(self.local_index, to),
                );
            }
        }
    }

    fn finish(&self) {
        let outcome = match &self.kind {
            PartyKind::Keygen => {
                let (secret, pub_key) = derive_pool_key(&self.entropy);
                let save = SimulatedSaveData {
                    group_entropy: hex::encode(&self.entropy),
                    secret: hex::encode(secret),
                    pub_key: hex::encode(&pub_key),
                };
                MpcOutcome::Keygen(KeygenOutcome {
                    pub_key,
                    save_data: serde_json::to_string(&save).unwrap_or_default(),
                })
            }
            PartyKind::Keysign { secret, msg_hashes } => {
                match sign_hashes(secret, msg_hashes) {
                    Ok(signatures) => MpcOutcome::Keysign(KeysignOutcome { signatures }),
                    Err(reason) => {
                        let _ = self.fail_tx.try_send(super::MpcFailure {
                            round: self.rounds[2].to_string(),
                            culprit_indices: vec![self.local_index],
                            reason,
                            evidence: Vec::new(),
                            is_unicast: false,
                        });
                        return;
                    }
                }
            }
        };
        if self.fin_tx.try_send(outcome).is_err() {
            debug!("finish queue already consumed");
        }
    }
}

impl MpcParty for SimulatedParty {
    fn start(&self) -> Result<(), MpcError> {
        if self.0.started.swap(true, Ordering::SeqCst) {
            return Err(MpcError::AlreadyStarted);
        }
        self.0.emit_commit();
        if self.0.n == 1 {
            self.0.finish();
        }
        Ok(())
    }

    fn update(&self, message: WireMessage) -> Result<(), MpcUpdateError> {
        let inner = &self.0;
        let from = message.from_party_index;
        let others = inner.n as usize - 1;
        let mut tracking = inner.tracking.lock().map_err(|_| MpcUpdateError {
            culprit_index: from,
            round: message.round.clone(),
            reason: "party state poisoned".to_string(),
            evidence: Vec::new(),
            is_unicast: !message.is_broadcast,
        })?;

        if tracking.phase == Phase::Done || from == inner.local_index || from >= inner.n {
            return Ok(());
        }

        match message.round.as_str() {
            r if r == inner.rounds[0] => {
                tracking.commits.entry(from).or_insert(message.wire_bytes);
                if tracking.commits.len() == others && tracking.phase == Phase::Commit {
                    tracking.phase = Phase::Reveal;
                    inner.emit_reveal();
                }
            }
            r if r == inner.rounds[1] => {
                let expected_commit = tracking.commits.get(&from).cloned();
                let commit_of_reveal = Sha256::digest(&message.wire_bytes).to_vec();
                match expected_commit {
                    Some(commit) if commit == commit_of_reveal => {
                        tracking.reveals.entry(from).or_insert(message.wire_bytes);
                    }
                    Some(_) => {
                        return Err(MpcUpdateError {
                            culprit_index: from,
                            round: message.round.clone(),
                            reason: "reveal does not match commitment".to_string(),
                            evidence: message.wire_bytes,
                            is_unicast: false,
                        });
                    }
                    None => {
                        // Reveal without a commitment cannot be checked.
                        return Err(MpcUpdateError {
                            culprit_index: from,
                            round: message.round.clone(),
                            reason: "reveal received before commitment".to_string(),
                            evidence: message.wire_bytes,
                            is_unicast: false,
                        });
                    }
                }
                if tracking.reveals.len() == others && tracking.phase == Phase::Reveal {
                    tracking.phase = Phase::Exchange;
                    inner.emit_exchanges();
                }
            }
            r if r == inner.rounds[2] => {
                let expected = inner.exchange_for(from, inner.local_index);
                if message.wire_bytes != expected {
                    return Err(MpcUpdateError {
                        culprit_index: from,
                        round: message.round.clone(),
                        reason: "exchange value does not verify".to_string(),
                        evidence: message.wire_bytes,
                        is_unicast: true,
                    });
                }
                tracking.exchanged.insert(from);
                if tracking.exchanged.len() == others && tracking.phase == Phase::Exchange {
                    tracking.phase = Phase::Done;
                    inner.finish();
                }
            }
            other => {
                return Err(MpcUpdateError {
                    culprit_index: from,
                    round: other.to_string(),
                    reason: "unexpected round tag".to_string(),
                    evidence: message.wire_bytes,
                    is_unicast: !message.is_broadcast,
                });
            }
        }
        Ok(())
    }

    fn awaiting_from(&self) -> Vec<u16> {
        let inner = &self.0;
        let Ok(tracking) = inner.tracking.lock() else {
            return Vec::new();
        };
        let remote = (0..inner.n).filter(|i| *i != inner.local_index);
        match tracking.phase {
            Phase::Commit => remote.filter(|i| !tracking.commits.contains_key(i)).collect(),
            Phase::Reveal => remote.filter(|i| !tracking.reveals.contains_key(i)).collect(),
            Phase::Exchange => remote.filter(|i| !tracking.exchanged.contains(i)).collect(),
            Phase::Done => Vec::new(),
        }
    }

    fn expecting_unicast(&self) -> bool {
        let inner = &self.0;
        inner
            .tracking
            .lock()
            .map(|t| t.phase == Phase::Exchange)
            .unwrap_or(false)
    }
}

/// Deterministically derive the pool key from the group entropy.
fn derive_pool_key(entropy: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut counter = 0u32;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(b"pool-secret");
        hasher.update(entropy);
        hasher.update(counter.to_be_bytes());
        let candidate = hasher.finalize();
        if let Ok(signing) = SigningKey::from_slice(&candidate) {
            let pub_key = VerifyingKey::from(&signing)
                .to_encoded_point(true)
                .as_bytes()
                .to_vec();
            return (candidate.to_vec(), pub_key);
        }
        counter += 1;
    }
}

fn sign_hashes(secret: &[u8], msg_hashes: &[Vec<u8>]) -> Result<Vec<MpcSignature>, String> {
    let signing =
        SigningKey::from_slice(secret).map_err(|e| format!("invalid pool secret: {e}"))?;
    msg_hashes
        .iter()
        .map(|hash| {
            let (signature, recovery_id) = signing
                .sign_prehash_recoverable(hash)
                .map_err(|e| format!("signing failed: {e}"))?;
            Ok(MpcSignature {
                msg_hash: hash.clone(),
                r: signature.r().to_bytes().to_vec(),
                s: signature.s().to_bytes().to_vec(),
                recovery_id: recovery_id.to_byte(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::hazmat::PrehashVerifier;

    fn keygen_args(keys: &[&str], local_index: u16) -> KeygenPartyArgs {
        let factory = SimulatedMpc::new();
        KeygenPartyArgs {
            party_pub_keys: keys.iter().map(|k| k.to_string()).collect(),
            local_index,
            threshold: 1,
            pre_params: factory.generate_pre_params(Duration::from_secs(1)).unwrap(),
        }
    }

    /// Run a full keygen among `n` in-process parties by hand-delivering
    /// every outgoing message to every addressee.
    async fn run_local_keygen(keys: &[&str]) -> Vec<KeygenOutcome> {
        let factory = SimulatedMpc::new();
        let n = keys.len();
        let mut parties = Vec::new();
        let mut channels = Vec::new();
        for i in 0..n {
            let (party, chans) = factory.keygen_party(keygen_args(keys, i as u16)).unwrap();
            party.start().unwrap();
            parties.push(party);
            channels.push(chans);
        }

        let mut outcomes: Vec<Option<KeygenOutcome>> = (0..n).map(|_| None).collect();
        while outcomes.iter().any(|o| o.is_none()) {
            let mut progressed = false;
            for i in 0..n {
                while let Ok(msg) = channels[i].outgoing.try_recv() {
                    progressed = true;
                    let targets: Vec<usize> = match &msg.to_party_indices {
                        Some(list) => list.iter().map(|t| *t as usize).collect(),
                        None => (0..n).filter(|j| *j != i).collect(),
                    };
                    for j in targets {
                        parties[j].update(msg.clone()).unwrap();
                    }
                }
                if let Ok(MpcOutcome::Keygen(outcome)) = channels[i].finished.try_recv() {
                    progressed = true;
                    outcomes[i] = Some(outcome);
                }
            }
            assert!(progressed, "simulation stalled");
        }
        outcomes.into_iter().map(|o| o.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_keygen_converges_on_one_key() {
        let keys = ["ka", "kb", "kc", "kd"];
        let outcomes = run_local_keygen(&keys).await;
        for outcome in &outcomes[1..] {
            assert_eq!(outcome.pub_key, outcomes[0].pub_key);
            assert_eq!(outcome.save_data, outcomes[0].save_data);
        }
        assert_eq!(outcomes[0].pub_key.len(), 33);
    }

    #[tokio::test]
    async fn test_keysign_signatures_verify_against_pool_key() {
        let keys = ["ka", "kb", "kc", "kd"];
        let outcomes = run_local_keygen(&keys).await;
        let pool_key = VerifyingKey::from_sec1_bytes(&outcomes[0].pub_key).unwrap();

        let factory = SimulatedMpc::new();
        let hashes = vec![
            Sha256::digest(b"m1").to_vec(),
            Sha256::digest(b"m2").to_vec(),
        ];
        let signer_keys = vec!["ka".to_string(), "kb".to_string()];
        let n = signer_keys.len();
        let mut parties = Vec::new();
        let mut channels = Vec::new();
        for i in 0..n {
            let (party, chans) = factory
                .sign_party(SignPartyArgs {
                    save_data: outcomes[i].save_data.clone(),
                    party_pub_keys: signer_keys.clone(),
                    local_index: i as u16,
                    threshold: 1,
                    msg_hashes: hashes.clone(),
                })
                .unwrap();
            party.start().unwrap();
            parties.push(party);
            channels.push(chans);
        }

        let mut results: Vec<Option<KeysignOutcome>> = vec![None, None];
        while results.iter().any(|r| r.is_none()) {
            let mut progressed = false;
            for i in 0..n {
                while let Ok(msg) = channels[i].outgoing.try_recv() {
                    progressed = true;
                    for j in (0..n).filter(|j| *j != i) {
                        parties[j].update(msg.clone()).unwrap();
                    }
                }
                if let Ok(MpcOutcome::Keysign(outcome)) = channels[i].finished.try_recv() {
                    progressed = true;
                    results[i] = Some(outcome);
                }
            }
            assert!(progressed, "simulation stalled");
        }

        let a = results[0].take().unwrap();
        let b = results[1].take().unwrap();
        assert_eq!(a.signatures.len(), 2);
        for (sa, sb) in a.signatures.iter().zip(&b.signatures) {
            assert_eq!(sa.r, sb.r);
            assert_eq!(sa.s, sb.s);
            let mut raw = sa.r.clone();
            raw.extend_from_slice(&sa.s);
            let signature = k256::ecdsa::Signature::from_slice(&raw).unwrap();
            pool_key.verify_prehash(&sa.msg_hash, &signature).unwrap();
        }
    }

    #[tokio::test]
    async fn test_invalid_reveal_is_attributed_to_its_sender() {
        let keys = ["ka", "kb", "kc"];
        let honest = SimulatedMpc::new();
        let corrupt = SimulatedMpc::with_invalid_reveal();

        let (victim, victim_chans) = honest.keygen_party(keygen_args(&keys, 0)).unwrap();
        let (bad, bad_chans) = corrupt.keygen_party(keygen_args(&keys, 1)).unwrap();
        victim.start().unwrap();
        bad.start().unwrap();

        // Exchange round-one commitments both ways.
        let bad_commit = bad_chans.outgoing.recv().await.unwrap();
        victim.update(bad_commit).unwrap();
        let victim_commit = victim_chans.outgoing.recv().await.unwrap();
        bad.update(victim_commit).unwrap();

        // Third party's commitment, crafted directly.
        let third = SimulatedMpc::new();
        let (third_party, third_chans) = third.keygen_party(keygen_args(&keys, 2)).unwrap();
        third_party.start().unwrap();
        let third_commit = third_chans.outgoing.recv().await.unwrap();
        victim.update(third_commit.clone()).unwrap();
        bad.update(third_commit).unwrap();

        // The corrupt node now reveals; its reveal fails the commitment check.
        let bad_reveal = bad_chans.outgoing.recv().await.unwrap();
        assert_eq!(bad_reveal.round, "kg-r2");
        let err = victim.update(bad_reveal).unwrap_err();
        assert_eq!(err.culprit_index, 1);
        assert!(!err.is_unicast);
    }

    #[test]
    fn test_awaiting_from_tracks_missing_parties() {
        let factory = SimulatedMpc::new();
        let (party, _chans) = factory
            .keygen_party(keygen_args(&["ka", "kb", "kc"], 0))
            .unwrap();
        party.start().unwrap();
        let mut waiting = party.awaiting_from();
        waiting.sort_unstable();
        assert_eq!(waiting, vec![1, 2]);
    }

    #[test]
    fn test_sign_party_rejects_garbage_save_data() {
        let factory = SimulatedMpc::new();
        let err = factory.sign_party(SignPartyArgs {
            save_data: "not json".to_string(),
            party_pub_keys: vec!["ka".to_string()],
            local_index: 0,
            threshold: 0,
            msg_hashes: vec![vec![0u8; 32]],
        });
        assert!(err.is_err());
    }
}
