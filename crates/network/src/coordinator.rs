//! Party formation.
//!
//! Two variants, selected by the requester's version:
//!
//! - **Leaderless**: every peer re-broadcasts its own intent for the session
//!   until it has seen intents from the full participant set, or enough of
//!   it, inside the party window.
//! - **Leader-based**: the peer whose id digests smallest for the session
//!   collects signed join requests and broadcasts the signed selection.
//!
//! Both variants resolve ties and surplus joiners by the lexicographic
//! order of PeerIds, so every honest node lands on the same chosen set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, trace, warn};

use tss_types::{
    choose_leader, peer_id_to_pub_key, pick_lexicographic, Envelope, JoinPartyLeaderMsg,
    JoinPartyLeaderRequest, JoinPartyLeaderResponse, JoinPartyRequestMsg, NodeIdentity,
    ReasonCode, TssProtocol,
};

use crate::communication::Communication;
use crate::error::NetworkError;
use crate::metrics::DROPPED_ENVELOPES;

/// How often intents and leader requests are re-sent while waiting.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Sessions worth of early traffic kept before the local node joins.
const EARLY_SESSION_CAP: usize = 64;

/// A formed party.
#[derive(Debug, Clone)]
pub struct JoinPartyOutcome {
    /// The agreed party, lexicographically ordered.
    pub chosen: Vec<PeerId>,
    /// Everyone that showed up, chosen or not.
    pub online: Vec<PeerId>,
    /// Peers whose intent disagreed with our participant list.
    pub mismatched: Vec<PeerId>,
}

/// Why party formation failed.
#[derive(Debug)]
pub enum JoinPartyFailure {
    /// Not enough peers joined inside the window.
    Timeout {
        online: Vec<PeerId>,
        mismatched: Vec<PeerId>,
    },
    /// The elected leader never answered.
    LeaderNotResponding { leader: PeerId },
    Network(NetworkError),
}

struct LeaderlessState {
    expected: HashSet<PeerId>,
    received: Mutex<HashSet<PeerId>>,
    mismatched: Mutex<HashSet<PeerId>>,
    all_joined: Notify,
}

struct LeaderState {
    expected: HashSet<PeerId>,
    block_height: i64,
    threshold: u16,
    joined: Mutex<HashSet<PeerId>>,
    mismatched: Mutex<HashSet<PeerId>>,
    all_joined: Notify,
}

struct FollowerState {
    leader: PeerId,
    leader_pub_key: String,
    response: Mutex<Option<JoinPartyLeaderResponse>>,
    got_response: Notify,
}

/// Forms a party of live peers for a session id.
pub struct PartyCoordinator {
    comm: Arc<Communication>,
    identity: Arc<NodeIdentity>,
    party_timeout: Duration,
    leaderless: Mutex<HashMap<String, Arc<LeaderlessState>>>,
    leading: Mutex<HashMap<String, Arc<LeaderState>>>,
    following: Mutex<HashMap<String, Arc<FollowerState>>>,
    /// Intents that arrived before the local node joined the session.
    early_intents: Mutex<HashMap<String, HashSet<PeerId>>>,
    /// Leader requests that arrived before we registered as leader.
    early_leader_requests: Mutex<HashMap<String, Vec<(PeerId, JoinPartyLeaderRequest)>>>,
}

impl PartyCoordinator {
    /// Create the coordinator and spawn the inbound handlers for both
    /// join-party protocols.
    pub fn spawn(
        comm: Arc<Communication>,
        identity: Arc<NodeIdentity>,
        party_timeout: Duration,
        mut join_party_rx: mpsc::Receiver<(PeerId, Envelope)>,
        mut leader_rx: mpsc::Receiver<(PeerId, Envelope)>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            comm,
            identity,
            party_timeout,
            leaderless: Mutex::new(HashMap::new()),
            leading: Mutex::new(HashMap::new()),
            following: Mutex::new(HashMap::new()),
            early_intents: Mutex::new(HashMap::new()),
            early_leader_requests: Mutex::new(HashMap::new()),
        });

        let intents = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some((peer, envelope)) = join_party_rx.recv().await {
                intents.handle_intent(peer, envelope).await;
            }
        });

        let leader = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some((peer, envelope)) = leader_rx.recv().await {
                leader.handle_leader_envelope(peer, envelope).await;
            }
        });

        coordinator
    }

    /// A frame only counts when its envelope identity matches the transport
    /// peer that delivered it.
    fn envelope_peer_matches(peer: &PeerId, envelope: &Envelope) -> bool {
        match peer_id_to_pub_key(peer) {
            Ok(pub_key) => pub_key == envelope.from_peer_pub_key,
            Err(_) => false,
        }
    }

    async fn handle_intent(&self, peer: PeerId, envelope: Envelope) {
        if !Self::envelope_peer_matches(&peer, &envelope) {
            DROPPED_ENVELOPES.with_label_values(&["spoofed"]).inc();
            return;
        }
        let msg: JoinPartyRequestMsg = match serde_json::from_slice(&envelope.payload) {
            Ok(msg) => msg,
            Err(_) => {
                DROPPED_ENVELOPES.with_label_values(&["malformed"]).inc();
                return;
            }
        };
        if msg.session_id != envelope.session_id {
            DROPPED_ENVELOPES.with_label_values(&["malformed"]).inc();
            return;
        }

        let state = {
            let sessions = self.leaderless.lock().await;
            sessions.get(&msg.session_id).cloned()
        };
        let Some(state) = state else {
            // The local node has not joined this session yet; keep the
            // intent so it is not lost to startup ordering.
            let mut early = self.early_intents.lock().await;
            if early.len() >= EARLY_SESSION_CAP && !early.contains_key(&msg.session_id) {
                if let Some(stale) = early.keys().next().cloned() {
                    early.remove(&stale);
                    DROPPED_ENVELOPES.with_label_values(&["early_evicted"]).inc();
                }
            }
            early.entry(msg.session_id.clone()).or_default().insert(peer);
            return;
        };

        if !state.expected.contains(&peer) {
            trace!(%peer, session = %msg.session_id, "intent from peer outside the party");
            return;
        }

        let claimed: HashSet<PeerId> = msg
            .peer_ids
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        if claimed != state.expected {
            warn!(%peer, session = %msg.session_id, "intent carries a different participant list");
            state.mismatched.lock().await.insert(peer);
            return;
        }

        let mut received = state.received.lock().await;
        received.insert(peer);
        if received.len() == state.expected.len() {
            state.all_joined.notify_one();
        }
    }

    /// Leaderless join: broadcast our intent until the full party is seen,
    /// then settle; on timeout settle for whoever showed up if they clear
    /// the threshold.
    pub async fn join_party_with_retry(
        &self,
        session_id: &str,
        peers: &[PeerId],
        threshold: usize,
    ) -> Result<JoinPartyOutcome, JoinPartyFailure> {
        let local_peer = self.comm.local_peer_id();
        let expected: HashSet<PeerId> = peers.iter().copied().collect();
        let remote: Vec<PeerId> = expected
            .iter()
            .copied()
            .filter(|p| *p != local_peer)
            .collect();

        let state = Arc::new(LeaderlessState {
            expected: expected.clone(),
            received: Mutex::new(HashSet::from([local_peer])),
            mismatched: Mutex::new(HashSet::new()),
            all_joined: Notify::new(),
        });

        self.leaderless
            .lock()
            .await
            .insert(session_id.to_string(), Arc::clone(&state));
        // Merge intents that beat us to the session.
        if let Some(early) = self.early_intents.lock().await.remove(session_id) {
            let mut received = state.received.lock().await;
            for peer in early {
                if expected.contains(&peer) {
                    received.insert(peer);
                }
            }
        }

        let intent = JoinPartyRequestMsg {
            session_id: session_id.to_string(),
            peer_ids: sorted_peer_strings(&expected),
        };
        let envelope = Envelope::new(
            session_id,
            TssProtocol::JoinParty,
            self.identity.pub_key(),
            serde_json::to_vec(&intent).unwrap_or_default(),
        );

        let deadline = tokio::time::sleep(self.party_timeout);
        tokio::pin!(deadline);
        let mut tick = tokio::time::interval(RETRY_INTERVAL);
        let mut complete = {
            let received = state.received.lock().await;
            received.len() == expected.len()
        };

        while !complete {
            tokio::select! {
                _ = &mut deadline => break,
                _ = state.all_joined.notified() => complete = true,
                _ = tick.tick() => {
                    let comm = Arc::clone(&self.comm);
                    let targets = remote.clone();
                    let env = envelope.clone();
                    tokio::spawn(async move {
                        let _ = comm.send_to_many(&targets, TssProtocol::JoinParty, &env).await;
                    });
                }
            }
        }

        self.leaderless.lock().await.remove(session_id);
        let online: Vec<PeerId> = state.received.lock().await.iter().copied().collect();
        let mismatched: Vec<PeerId> = state.mismatched.lock().await.iter().copied().collect();

        if online.len() >= threshold + 1 {
            // One last intent so stragglers still waiting can settle too.
            let comm = Arc::clone(&self.comm);
            let targets = remote.clone();
            tokio::spawn(async move {
                let _ = comm.send_to_many(&targets, TssProtocol::JoinParty, &envelope).await;
            });

            let chosen = pick_lexicographic(&online, threshold + 1);
            info!(session = session_id, joined = online.len(), "party formed");
            Ok(JoinPartyOutcome {
                chosen,
                online,
                mismatched,
            })
        } else {
            warn!(
                session = session_id,
                joined = online.len(),
                needed = threshold + 1,
                "join party timed out"
            );
            Err(JoinPartyFailure::Timeout { online, mismatched })
        }
    }

    async fn handle_leader_envelope(&self, peer: PeerId, envelope: Envelope) {
        if !Self::envelope_peer_matches(&peer, &envelope) {
            DROPPED_ENVELOPES.with_label_values(&["spoofed"]).inc();
            return;
        }
        let msg: JoinPartyLeaderMsg = match serde_json::from_slice(&envelope.payload) {
            Ok(msg) => msg,
            Err(_) => {
                DROPPED_ENVELOPES.with_label_values(&["malformed"]).inc();
                return;
            }
        };
        match msg {
            JoinPartyLeaderMsg::Request(req) => self.handle_leader_request(peer, req).await,
            JoinPartyLeaderMsg::Response(resp) => self.handle_leader_response(peer, resp).await,
        }
    }

    async fn handle_leader_request(&self, peer: PeerId, req: JoinPartyLeaderRequest) {
        let state = {
            let leading = self.leading.lock().await;
            leading.get(&req.session_id).cloned()
        };
        let Some(state) = state else {
            let mut early = self.early_leader_requests.lock().await;
            if early.len() >= EARLY_SESSION_CAP && !early.contains_key(&req.session_id) {
                if let Some(stale) = early.keys().next().cloned() {
                    early.remove(&stale);
                    DROPPED_ENVELOPES.with_label_values(&["early_evicted"]).inc();
                }
            }
            let buffered = early.entry(req.session_id.clone()).or_default();
            // Re-sent requests are identical; one per peer is enough.
            if !buffered.iter().any(|(p, _)| *p == peer) {
                buffered.push((peer, req));
            }
            return;
        };
        self.admit_leader_request(&state, peer, req).await;
    }

    async fn admit_leader_request(
        &self,
        state: &LeaderState,
        peer: PeerId,
        req: JoinPartyLeaderRequest,
    ) {
        if !state.expected.contains(&peer) {
            trace!(%peer, session = %req.session_id, "leader request from peer outside the party");
            return;
        }
        let Ok(sender_key) = peer_id_to_pub_key(&peer) else {
            return;
        };
        let digest = JoinPartyLeaderRequest::signable_bytes(
            &req.session_id,
            req.block_height,
            &req.peer_ids,
            req.threshold,
        );
        if !tss_types::verify_node_signature(&sender_key, &digest, &req.signature) {
            warn!(%peer, session = %req.session_id, "leader request signature does not verify");
            return;
        }

        let claimed: HashSet<PeerId> = req
            .peer_ids
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        if claimed != state.expected
            || req.block_height != state.block_height
            || req.threshold != state.threshold
        {
            warn!(%peer, session = %req.session_id, "leader request disagrees with our session");
            state.mismatched.lock().await.insert(peer);
            return;
        }

        let mut joined = state.joined.lock().await;
        joined.insert(peer);
        // The leader itself is the +1.
        if joined.len() + 1 == state.expected.len() {
            state.all_joined.notify_one();
        }
    }

    async fn handle_leader_response(&self, peer: PeerId, resp: JoinPartyLeaderResponse) {
        let state = {
            let following = self.following.lock().await;
            following.get(&resp.session_id).cloned()
        };
        let Some(state) = state else {
            trace!(%peer, session = %resp.session_id, "leader response for unknown session");
            return;
        };
        if peer != state.leader {
            warn!(%peer, session = %resp.session_id, "leader response from non-leader");
            return;
        }
        let digest = JoinPartyLeaderResponse::signable_bytes(
            &resp.session_id,
            resp.reason_code,
            &resp.chosen_peers,
        );
        if !tss_types::verify_node_signature(&state.leader_pub_key, &digest, &resp.signature) {
            warn!(%peer, session = %resp.session_id, "leader response signature does not verify");
            return;
        }
        *state.response.lock().await = Some(resp);
        state.got_response.notify_one();
    }

    /// Leader-based join. The leader is derived from the session id and
    /// block height; this node either leads or follows accordingly.
    pub async fn join_party_with_leader(
        &self,
        session_id: &str,
        block_height: i64,
        peers: &[PeerId],
        threshold: usize,
    ) -> Result<JoinPartyOutcome, JoinPartyFailure> {
        let Some(leader) = choose_leader(session_id, block_height, peers) else {
            return Err(JoinPartyFailure::Network(NetworkError::JoinParty(
                "no participants".to_string(),
            )));
        };
        if leader == self.comm.local_peer_id() {
            self.lead_party(session_id, block_height, peers, threshold)
                .await
        } else {
            self.follow_leader(session_id, block_height, peers, threshold, leader)
                .await
        }
    }

    async fn lead_party(
        &self,
        session_id: &str,
        block_height: i64,
        peers: &[PeerId],
        threshold: usize,
    ) -> Result<JoinPartyOutcome, JoinPartyFailure> {
        let local_peer = self.comm.local_peer_id();
        let expected: HashSet<PeerId> = peers.iter().copied().collect();
        let state = Arc::new(LeaderState {
            expected: expected.clone(),
            block_height,
            threshold: threshold as u16,
            joined: Mutex::new(HashSet::new()),
            mismatched: Mutex::new(HashSet::new()),
            all_joined: Notify::new(),
        });
        self.leading
            .lock()
            .await
            .insert(session_id.to_string(), Arc::clone(&state));

        // Requests that arrived before we started leading.
        if let Some(early) = self.early_leader_requests.lock().await.remove(session_id) {
            for (peer, req) in early {
                self.admit_leader_request(&state, peer, req).await;
            }
        }

        info!(session = session_id, "leading join party");
        let complete = {
            let joined = state.joined.lock().await;
            joined.len() + 1 == expected.len()
        };
        if !complete {
            tokio::select! {
                _ = tokio::time::sleep(self.party_timeout) => {}
                _ = state.all_joined.notified() => {}
            }
        }

        self.leading.lock().await.remove(session_id);
        let mut online: Vec<PeerId> = state.joined.lock().await.iter().copied().collect();
        online.push(local_peer);
        let mismatched: Vec<PeerId> = state.mismatched.lock().await.iter().copied().collect();
        let remote: Vec<PeerId> = expected
            .iter()
            .copied()
            .filter(|p| *p != local_peer)
            .collect();

        if online.len() >= threshold + 1 {
            let chosen = pick_lexicographic(&online, threshold + 1);
            let resp = JoinPartyLeaderResponse::signed(
                &self.identity,
                session_id.to_string(),
                ReasonCode::Success,
                chosen.iter().map(|p| p.to_string()).collect(),
            );
            self.broadcast_leader_response(session_id, &remote, &resp).await;
            info!(session = session_id, joined = online.len(), "leader formed party");
            Ok(JoinPartyOutcome {
                chosen,
                online,
                mismatched,
            })
        } else {
            let resp = JoinPartyLeaderResponse::signed(
                &self.identity,
                session_id.to_string(),
                ReasonCode::Timeout,
                online.iter().map(|p| p.to_string()).collect(),
            );
            self.broadcast_leader_response(session_id, &remote, &resp).await;
            warn!(
                session = session_id,
                joined = online.len(),
                needed = threshold + 1,
                "leader timed out waiting for the party"
            );
            Err(JoinPartyFailure::Timeout { online, mismatched })
        }
    }

    async fn broadcast_leader_response(
        &self,
        session_id: &str,
        targets: &[PeerId],
        resp: &JoinPartyLeaderResponse,
    ) {
        let envelope = Envelope::new(
            session_id,
            TssProtocol::JoinPartyLeader,
            self.identity.pub_key(),
            serde_json::to_vec(&JoinPartyLeaderMsg::Response(resp.clone())).unwrap_or_default(),
        );
        for (peer, result) in self
            .comm
            .send_to_many(targets, TssProtocol::JoinPartyLeader, &envelope)
            .await
        {
            if let Err(e) = result {
                debug!(%peer, session = session_id, "leader response not delivered: {e}");
            }
        }
    }

    async fn follow_leader(
        &self,
        session_id: &str,
        block_height: i64,
        peers: &[PeerId],
        threshold: usize,
        leader: PeerId,
    ) -> Result<JoinPartyOutcome, JoinPartyFailure> {
        let leader_pub_key = peer_id_to_pub_key(&leader)
            .map_err(|e| JoinPartyFailure::Network(NetworkError::JoinParty(e.to_string())))?;
        let state = Arc::new(FollowerState {
            leader,
            leader_pub_key,
            response: Mutex::new(None),
            got_response: Notify::new(),
        });
        self.following
            .lock()
            .await
            .insert(session_id.to_string(), Arc::clone(&state));

        let request = JoinPartyLeaderRequest::signed(
            &self.identity,
            session_id.to_string(),
            block_height,
            sorted_peer_strings(&peers.iter().copied().collect()),
            threshold as u16,
        );
        let envelope = Envelope::new(
            session_id,
            TssProtocol::JoinPartyLeader,
            self.identity.pub_key(),
            serde_json::to_vec(&JoinPartyLeaderMsg::Request(request)).unwrap_or_default(),
        );

        debug!(session = session_id, %leader, "following join party leader");
        let deadline = tokio::time::sleep(self.party_timeout);
        tokio::pin!(deadline);
        let mut tick = tokio::time::interval(RETRY_INTERVAL);
        let mut answered = false;

        while !answered {
            tokio::select! {
                _ = &mut deadline => break,
                _ = state.got_response.notified() => answered = true,
                _ = tick.tick() => {
                    let comm = Arc::clone(&self.comm);
                    let env = envelope.clone();
                    tokio::spawn(async move {
                        let _ = comm.send_to(leader, TssProtocol::JoinPartyLeader, env).await;
                    });
                }
            }
        }

        self.following.lock().await.remove(session_id);
        let response = state.response.lock().await.clone();

        match response {
            Some(resp) => {
                let listed: Vec<PeerId> = resp
                    .chosen_peers
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect();
                match resp.reason_code {
                    ReasonCode::Success => {
                        info!(session = session_id, "adopted leader selection");
                        Ok(JoinPartyOutcome {
                            chosen: listed.clone(),
                            online: listed,
                            mismatched: Vec::new(),
                        })
                    }
                    ReasonCode::Timeout => Err(JoinPartyFailure::Timeout {
                        online: listed,
                        mismatched: Vec::new(),
                    }),
                }
            }
            None => {
                warn!(session = session_id, %leader, "leader did not respond");
                Err(JoinPartyFailure::LeaderNotResponding { leader })
            }
        }
    }
}

fn sorted_peer_strings(peers: &HashSet<PeerId>) -> Vec<String> {
    let mut out: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{CommunicationConfig, InboundSinks};
    use tss_types::node_identity_from_secret;

    fn test_identity(seed: u8) -> Arc<NodeIdentity> {
        let mut secret = [seed; 32];
        secret[0] = 1;
        Arc::new(node_identity_from_secret(&secret).unwrap())
    }

    struct TestNode {
        comm: Arc<Communication>,
        coordinator: Arc<PartyCoordinator>,
        identity: Arc<NodeIdentity>,
    }

    async fn spawn_node(seed: u8, timeout: Duration) -> TestNode {
        let identity = test_identity(seed);
        let (jp_tx, jp_rx) = mpsc::channel(64);
        let (jl_tx, jl_rx) = mpsc::channel(64);
        let (tss_tx, _tss_rx) = mpsc::channel(64);
        let (sn_tx, _sn_rx) = mpsc::channel(64);
        let comm = Arc::new(
            Communication::spawn(
                &identity,
                CommunicationConfig {
                    rendezvous: "test".to_string(),
                    port: 0,
                    bootstrap_peers: Vec::new(),
                    external_ip: None,
                },
                InboundSinks {
                    join_party: jp_tx,
                    join_party_leader: jl_tx,
                    tss: tss_tx,
                    signature_notifier: sn_tx,
                },
                None,
            )
            .unwrap(),
        );
        let coordinator = PartyCoordinator::spawn(
            Arc::clone(&comm),
            Arc::clone(&identity),
            timeout,
            jp_rx,
            jl_rx,
        );
        TestNode {
            comm,
            coordinator,
            identity,
        }
    }

    #[tokio::test]
    async fn test_leaderless_join_forms_full_party() {
        let a = spawn_node(20, Duration::from_secs(10)).await;
        let b = spawn_node(21, Duration::from_secs(10)).await;

        let addr_b = b.comm.await_listen_addr().await.unwrap().with(
            libp2p::multiaddr::Protocol::P2p(b.comm.local_peer_id()),
        );
        a.comm.dial(addr_b).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let peers = vec![a.comm.local_peer_id(), b.comm.local_peer_id()];
        let (ra, rb) = tokio::join!(
            a.coordinator.join_party_with_retry("sess-1", &peers, 1),
            b.coordinator.join_party_with_retry("sess-1", &peers, 1),
        );
        let ra = ra.expect("node a should form the party");
        let rb = rb.expect("node b should form the party");
        assert_eq!(ra.chosen, rb.chosen);
        assert_eq!(ra.chosen.len(), 2);
        assert!(ra.mismatched.is_empty());
    }

    #[tokio::test]
    async fn test_leaderless_join_times_out_without_peers() {
        let a = spawn_node(30, Duration::from_millis(500)).await;
        let ghost = test_identity(31);

        let peers = vec![a.comm.local_peer_id(), ghost.peer_id()];
        let result = a
            .coordinator
            .join_party_with_retry("sess-2", &peers, 1)
            .await;
        match result {
            Err(JoinPartyFailure::Timeout { online, .. }) => {
                assert_eq!(online, vec![a.comm.local_peer_id()]);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leader_join_two_nodes() {
        let a = spawn_node(40, Duration::from_secs(10)).await;
        let b = spawn_node(41, Duration::from_secs(10)).await;

        let addr_a = a.comm.await_listen_addr().await.unwrap().with(
            libp2p::multiaddr::Protocol::P2p(a.comm.local_peer_id()),
        );
        let addr_b = b.comm.await_listen_addr().await.unwrap().with(
            libp2p::multiaddr::Protocol::P2p(b.comm.local_peer_id()),
        );
        a.comm.dial(addr_b).unwrap();
        b.comm.dial(addr_a).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let peers = vec![a.comm.local_peer_id(), b.comm.local_peer_id()];
        let (ra, rb) = tokio::join!(
            a.coordinator
                .join_party_with_leader("sess-3", 7, &peers, 1),
            b.coordinator
                .join_party_with_leader("sess-3", 7, &peers, 1),
        );
        let ra = ra.expect("node a should form the party");
        let rb = rb.expect("node b should form the party");
        assert_eq!(ra.chosen, rb.chosen);
        assert_eq!(ra.chosen.len(), 2);
    }

    #[tokio::test]
    async fn test_follower_reports_unreachable_leader() {
        let a = spawn_node(50, Duration::from_millis(800)).await;
        let ghost = test_identity(51);

        let peers = vec![a.comm.local_peer_id(), ghost.peer_id()];
        // Force the ghost to lead by finding inputs where it wins election.
        let mut height = 0i64;
        loop {
            if choose_leader("sess-4", height, &peers) == Some(ghost.peer_id()) {
                break;
            }
            height += 1;
            assert!(height < 1024, "leader election never picked the ghost");
        }

        let result = a
            .coordinator
            .join_party_with_leader("sess-4", height, &peers, 1)
            .await;
        match result {
            Err(JoinPartyFailure::LeaderNotResponding { leader }) => {
                assert_eq!(leader, ghost.peer_id());
            }
            other => panic!("expected leader failure, got {other:?}"),
        }
        let _ = a.identity.pub_key();
    }
}
