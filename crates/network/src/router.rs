//! Session message routing.
//!
//! One router instance serves every live session. Outbound round messages
//! fan out to the party over `/p2p/tss/0.1.0`; inbound frames are validated
//! against the session's membership, run through the broadcast-confirmation
//! check, and queued for the session engine.
//!
//! Broadcast confirmation: each recipient of a broadcast echoes the payload
//! hash to the other recipients. The broadcast is delivered only once
//! `threshold` matching echoes are in; a diverging echo means the
//! broadcaster equivocated and is surfaced as a mismatch item instead.
//!
//! Ordering: frames from one sender are delivered to the engine in send
//! order. While a broadcast from a sender awaits confirmation, later frames
//! from that sender queue behind it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace, warn};

use tss_types::{
    peer_id_to_pub_key, ConfirmMessage, Envelope, NodeIdentity, Party, TssPayload, TssProtocol,
    WireMessage,
};

use crate::communication::Communication;
use crate::error::{NetworkError, NetworkResult};
use crate::metrics::{DROPPED_ENVELOPES, UNRESPONSIVE_PEERS};

/// Bound on a session's inbound queue; overflow drops the oldest entry.
const MAX_SESSION_QUEUE: usize = 256;

/// Bound on frames buffered for sessions the engine has not registered yet.
const MAX_EARLY_FRAMES: usize = 256;
const MAX_EARLY_SESSIONS: usize = 64;

/// A round message that passed membership and confirmation checks.
#[derive(Debug, Clone)]
pub struct VerifiedMessage {
    pub from_pub_key: String,
    pub message: WireMessage,
}

/// What the engine receives from the router.
#[derive(Debug, Clone)]
pub enum InboundItem {
    Wire(VerifiedMessage),
    /// Broadcast acknowledgement hashes diverged; the broadcaster is the
    /// attributable party.
    Mismatch { round: String, culprit: String },
}

struct BroadcastState {
    payload: Option<WireMessage>,
    own_hash: Option<String>,
    /// Confirmer public key → payload hash they reported.
    confirms: HashMap<String, String>,
    delivered: bool,
    flagged: bool,
}

impl BroadcastState {
    fn new() -> Self {
        Self {
            payload: None,
            own_hash: None,
            confirms: HashMap::new(),
            delivered: false,
            flagged: false,
        }
    }
}

struct SessionState {
    session_id: String,
    party: Party,
    threshold: usize,
    queue: Mutex<VecDeque<InboundItem>>,
    notify: Notify,
    /// Keyed by (broadcaster public key, round tag).
    broadcasts: Mutex<HashMap<(String, String), BroadcastState>>,
    /// Frames held back to preserve per-sender order while one of the
    /// sender's broadcasts awaits confirmation.
    held_back: Mutex<HashMap<String, VecDeque<WireMessage>>>,
    unresponsive: Mutex<HashSet<PeerId>>,
}

impl SessionState {
    async fn push(&self, item: InboundItem) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= MAX_SESSION_QUEUE {
            queue.pop_front();
            DROPPED_ENVELOPES.with_label_values(&["queue_overflow"]).inc();
            warn!(session = %self.session_id, "inbound queue full, dropped oldest message");
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Engine-side handle to one registered session.
pub struct SessionHandle {
    state: Arc<SessionState>,
    router: Arc<MessageRouter>,
}

impl SessionHandle {
    /// Next validated inbound item, waiting if none is queued.
    pub async fn recv(&self) -> InboundItem {
        loop {
            if let Some(item) = self.state.queue.lock().await.pop_front() {
                return item;
            }
            self.state.notify.notified().await;
        }
    }

    /// Fan one round message out to the party.
    pub async fn send(&self, message: WireMessage) -> NetworkResult<()> {
        self.router.send_wire(&self.state, message).await
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    /// Remove the session and drop any queued traffic.
    pub async fn unregister(self) {
        self.router.unregister_session(&self.state.session_id).await;
    }
}

/// Routes round messages between session engines and the transport.
pub struct MessageRouter {
    comm: Arc<Communication>,
    identity: Arc<NodeIdentity>,
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    early: Mutex<HashMap<String, VecDeque<(PeerId, Envelope)>>>,
}

impl MessageRouter {
    /// Create the router and spawn the inbound handler for the tss protocol.
    pub fn spawn(
        comm: Arc<Communication>,
        identity: Arc<NodeIdentity>,
        mut tss_rx: mpsc::Receiver<(PeerId, Envelope)>,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            comm,
            identity,
            sessions: Mutex::new(HashMap::new()),
            early: Mutex::new(HashMap::new()),
        });

        let inbound = Arc::clone(&router);
        tokio::spawn(async move {
            while let Some((peer, envelope)) = tss_rx.recv().await {
                inbound.handle_envelope(peer, envelope).await;
            }
        });

        router
    }

    /// Register a session before its first round message is sent.
    ///
    /// Frames that arrived early for this session are replayed through
    /// validation immediately.
    pub async fn register(
        self: &Arc<Self>,
        session_id: &str,
        party: Party,
    ) -> NetworkResult<SessionHandle> {
        let state = Arc::new(SessionState {
            session_id: session_id.to_string(),
            threshold: party.threshold() as usize,
            party,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            broadcasts: Mutex::new(HashMap::new()),
            held_back: Mutex::new(HashMap::new()),
            unresponsive: Mutex::new(HashSet::new()),
        });
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(session_id) {
                return Err(NetworkError::SessionExists(session_id.to_string()));
            }
            sessions.insert(session_id.to_string(), Arc::clone(&state));
        }

        let early = self.early.lock().await.remove(session_id);
        if let Some(frames) = early {
            debug!(session = session_id, count = frames.len(), "replaying early frames");
            for (peer, envelope) in frames {
                self.handle_envelope(peer, envelope).await;
            }
        }

        Ok(SessionHandle {
            state,
            router: Arc::clone(self),
        })
    }

    pub async fn unregister_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
        self.early.lock().await.remove(session_id);
    }

    async fn send_wire(&self, state: &SessionState, message: WireMessage) -> NetworkResult<()> {
        let targets: Vec<_> = if message.is_broadcast {
            state.party.remote_members().cloned().collect()
        } else {
            let indices = message.to_party_indices.clone().unwrap_or_default();
            indices
                .iter()
                .filter_map(|i| state.party.member_at(*i))
                .filter(|m| m.pub_key != self.identity.pub_key())
                .cloned()
                .collect()
        };

        let envelope = Envelope::new(
            state.session_id.clone(),
            TssProtocol::Tss,
            self.identity.pub_key(),
            serde_json::to_vec(&TssPayload::Wire(message))
                .map_err(|e| NetworkError::Codec(e.to_string()))?,
        );

        let unresponsive = state.unresponsive.lock().await.clone();
        let sends = targets
            .iter()
            .filter(|m| !unresponsive.contains(&m.peer_id))
            .map(|member| {
                let envelope = envelope.clone();
                async move {
                    let result = self
                        .comm
                        .send_to(member.peer_id, TssProtocol::Tss, envelope)
                        .await;
                    (member.peer_id, result)
                }
            })
            .collect::<Vec<_>>();

        for (peer, result) in futures::future::join_all(sends).await {
            if let Err(e) = result {
                UNRESPONSIVE_PEERS.inc();
                warn!(session = %state.session_id, %peer, "peer unresponsive: {e}");
                state.unresponsive.lock().await.insert(peer);
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_envelope(&self, peer: PeerId, envelope: Envelope) {
        let matches = peer_id_to_pub_key(&peer)
            .map(|pk| pk == envelope.from_peer_pub_key)
            .unwrap_or(false);
        if !matches {
            DROPPED_ENVELOPES.with_label_values(&["spoofed"]).inc();
            return;
        }

        let state = {
            let sessions = self.sessions.lock().await;
            sessions.get(&envelope.session_id).cloned()
        };
        let Some(state) = state else {
            let mut early = self.early.lock().await;
            if early.len() >= MAX_EARLY_SESSIONS && !early.contains_key(&envelope.session_id) {
                // Evict an arbitrary stale session so the buffer cannot be
                // poisoned by sessions this node never registers.
                if let Some(stale) = early.keys().next().cloned() {
                    early.remove(&stale);
                    DROPPED_ENVELOPES.with_label_values(&["early_evicted"]).inc();
                }
            }
            let frames = early.entry(envelope.session_id.clone()).or_default();
            if frames.len() >= MAX_EARLY_FRAMES {
                frames.pop_front();
                DROPPED_ENVELOPES.with_label_values(&["early_overflow"]).inc();
            }
            frames.push_back((peer, envelope));
            return;
        };

        if !state.party.contains_pub_key(&envelope.from_peer_pub_key) {
            DROPPED_ENVELOPES.with_label_values(&["unknown_member"]).inc();
            trace!(session = %envelope.session_id, %peer, "frame from non-member");
            return;
        }

        let payload: TssPayload = match serde_json::from_slice(&envelope.payload) {
            Ok(p) => p,
            Err(_) => {
                DROPPED_ENVELOPES.with_label_values(&["malformed"]).inc();
                return;
            }
        };

        match payload {
            TssPayload::Wire(message) => {
                let sender = envelope.from_peer_pub_key.clone();
                // Index must agree with the lexicographic party ordering.
                if state.party.index_of(&sender) != Some(message.from_party_index) {
                    DROPPED_ENVELOPES.with_label_values(&["malformed"]).inc();
                    return;
                }
                self.process_wire(&state, sender, message).await;
            }
            TssPayload::Confirm(confirm) => {
                self.process_confirm(&state, envelope.from_peer_pub_key.clone(), confirm)
                    .await;
            }
        }
    }

    /// Route one wire message, holding it back if an earlier broadcast from
    /// the same sender is still unconfirmed.
    async fn process_wire(&self, state: &Arc<SessionState>, sender: String, message: WireMessage) {
        {
            let broadcasts = state.broadcasts.lock().await;
            let sender_has_pending = broadcasts.iter().any(|((s, _), b)| {
                *s == sender && b.payload.is_some() && !b.delivered && !b.flagged
            });
            if sender_has_pending {
                let mut held = state.held_back.lock().await;
                held.entry(sender).or_default().push_back(message);
                return;
            }
        }
        self.admit_wire(state, sender, message).await;
    }

    async fn admit_wire(&self, state: &Arc<SessionState>, sender: String, message: WireMessage) {
        if !message.is_broadcast {
            state.push(InboundItem::Wire(VerifiedMessage {
                from_pub_key: sender,
                message,
            }))
            .await;
            return;
        }

        let hash = message.payload_hash();
        let round = message.round.clone();
        {
            let mut broadcasts = state.broadcasts.lock().await;
            let bstate = broadcasts
                .entry((sender.clone(), round.clone()))
                .or_insert_with(BroadcastState::new);
            if bstate.payload.is_some() {
                // Duplicate broadcast frame; the first copy stands.
                return;
            }
            bstate.payload = Some(message);
            bstate.own_hash = Some(hash.clone());
        }

        self.send_confirms(state, &sender, &round, &hash).await;
        self.settle_broadcast(state, &sender, &round).await;
    }

    async fn send_confirms(
        &self,
        state: &Arc<SessionState>,
        broadcaster: &str,
        round: &str,
        hash: &str,
    ) {
        let confirm = ConfirmMessage {
            round: round.to_string(),
            broadcaster: broadcaster.to_string(),
            payload_hash: hash.to_string(),
        };
        let Ok(payload) = serde_json::to_vec(&TssPayload::Confirm(confirm)) else {
            return;
        };
        let envelope = Envelope::new(
            state.session_id.clone(),
            TssProtocol::Tss,
            self.identity.pub_key(),
            payload,
        );
        let targets: Vec<PeerId> = state
            .party
            .remote_members()
            .filter(|m| m.pub_key != broadcaster)
            .map(|m| m.peer_id)
            .collect();

        let comm = Arc::clone(&self.comm);
        tokio::spawn(async move {
            let _ = comm.send_to_many(&targets, TssProtocol::Tss, &envelope).await;
        });
    }

    async fn process_confirm(
        &self,
        state: &Arc<SessionState>,
        confirmer: String,
        confirm: ConfirmMessage,
    ) {
        if confirmer == confirm.broadcaster {
            // A broadcaster cannot vouch for its own payload.
            DROPPED_ENVELOPES.with_label_values(&["malformed"]).inc();
            return;
        }
        {
            let mut broadcasts = state.broadcasts.lock().await;
            let bstate = broadcasts
                .entry((confirm.broadcaster.clone(), confirm.round.clone()))
                .or_insert_with(BroadcastState::new);
            // First report from each confirmer wins; repeats are idempotent.
            bstate
                .confirms
                .entry(confirmer)
                .or_insert(confirm.payload_hash);
        }
        self.settle_broadcast(state, &confirm.broadcaster, &confirm.round)
            .await;
    }

    /// Deliver the broadcast once enough matching confirms are in, or flag
    /// the broadcaster as soon as any view diverges from ours.
    async fn settle_broadcast(&self, state: &Arc<SessionState>, broadcaster: &str, round: &str) {
        let mut to_deliver = None;
        let mut mismatch = false;
        {
            let mut broadcasts = state.broadcasts.lock().await;
            let Some(bstate) =
                broadcasts.get_mut(&(broadcaster.to_string(), round.to_string()))
            else {
                return;
            };
            let Some(own_hash) = bstate.own_hash.clone() else {
                // Confirms arrived before our copy of the payload.
                return;
            };
            if bstate.delivered || bstate.flagged {
                return;
            }

            if bstate.confirms.values().any(|h| *h != own_hash) {
                bstate.flagged = true;
                mismatch = true;
            } else {
                // A broadcast can collect at most n-2 confirms (everyone but
                // the sender and ourselves), so cap the requirement there.
                let needed = state.threshold.min(state.party.len().saturating_sub(2));
                let matching = bstate.confirms.values().filter(|h| **h == own_hash).count();
                if matching >= needed {
                    bstate.delivered = true;
                    to_deliver = bstate.payload.clone();
                }
            }
        }

        if mismatch {
            warn!(
                session = %state.session_id,
                broadcaster,
                round,
                "broadcast acknowledgement hashes diverged"
            );
            state
                .push(InboundItem::Mismatch {
                    round: round.to_string(),
                    culprit: broadcaster.to_string(),
                })
                .await;
            return;
        }

        if let Some(message) = to_deliver {
            state
                .push(InboundItem::Wire(VerifiedMessage {
                    from_pub_key: broadcaster.to_string(),
                    message,
                }))
                .await;
            self.flush_held_back(state, broadcaster).await;
        }
    }

    /// Re-admit frames that queued behind a just-delivered broadcast.
    async fn flush_held_back(&self, state: &Arc<SessionState>, sender: &str) {
        loop {
            let next = {
                let mut held = state.held_back.lock().await;
                match held.get_mut(sender) {
                    Some(queue) => queue.pop_front(),
                    None => None,
                }
            };
            let Some(message) = next else { break };
            let is_broadcast = message.is_broadcast;
            Box::pin(self.admit_wire(state, sender.to_string(), message)).await;
            if is_broadcast {
                // The flushed broadcast now awaits its own confirmation;
                // anything behind it stays held back.
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{Communication, CommunicationConfig, InboundSinks};
    use tss_types::node_identity_from_secret;

    fn identity(seed: u8) -> Arc<NodeIdentity> {
        let mut secret = [seed; 32];
        secret[0] = 1;
        Arc::new(node_identity_from_secret(&secret).unwrap())
    }

    async fn test_router(local: &Arc<NodeIdentity>) -> Arc<MessageRouter> {
        let (jp_tx, _jp_rx) = mpsc::channel(8);
        let (jl_tx, _jl_rx) = mpsc::channel(8);
        let (tss_tx, tss_rx) = mpsc::channel(64);
        let (sn_tx, _sn_rx) = mpsc::channel(8);
        let comm = Arc::new(
            Communication::spawn(
                local,
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
        MessageRouter::spawn(comm, Arc::clone(local), tss_rx)
    }

    fn broadcast(from_index: u16, round: &str, bytes: &[u8]) -> WireMessage {
        WireMessage {
            round: round.to_string(),
            from_party_index: from_index,
            to_party_indices: None,
            is_broadcast: true,
            is_to_old_and_new_committees: false,
            wire_bytes: bytes.to_vec(),
        }
    }

    fn unicast(from_index: u16, to: Vec<u16>, round: &str, bytes: &[u8]) -> WireMessage {
        WireMessage {
            round: round.to_string(),
            from_party_index: from_index,
            to_party_indices: Some(to),
            is_broadcast: false,
            is_to_old_and_new_committees: false,
            wire_bytes: bytes.to_vec(),
        }
    }

    fn wire_envelope(session: &str, from: &Arc<NodeIdentity>, msg: &WireMessage) -> Envelope {
        Envelope::new(
            session,
            TssProtocol::Tss,
            from.pub_key(),
            serde_json::to_vec(&TssPayload::Wire(msg.clone())).unwrap(),
        )
    }

    fn confirm_envelope(
        session: &str,
        from: &Arc<NodeIdentity>,
        broadcaster: &str,
        round: &str,
        hash: &str,
    ) -> Envelope {
        Envelope::new(
            session,
            TssProtocol::Tss,
            from.pub_key(),
            serde_json::to_vec(&TssPayload::Confirm(ConfirmMessage {
                round: round.to_string(),
                broadcaster: broadcaster.to_string(),
                payload_hash: hash.to_string(),
            }))
            .unwrap(),
        )
    }

    struct Fixture {
        router: Arc<MessageRouter>,
        handle: SessionHandle,
        ids: Vec<Arc<NodeIdentity>>,
        party: Party,
    }

    /// Four members; ids[0] is the local node.
    async fn fixture(session: &str) -> Fixture {
        let ids: Vec<Arc<NodeIdentity>> = (60..64).map(identity).collect();
        let keys: Vec<String> = ids.iter().map(|i| i.pub_key().to_string()).collect();
        let party = Party::from_pub_keys(ids[0].pub_key(), &keys, 1).unwrap();
        let router = test_router(&ids[0]).await;
        let handle = router.register(session, party.clone()).await.unwrap();
        Fixture {
            router,
            handle,
            ids,
            party,
        }
    }

    fn by_index(f: &Fixture, index: u16) -> Arc<NodeIdentity> {
        let key = f.party.member_at(index).unwrap().pub_key.clone();
        f.ids.iter().find(|i| i.pub_key() == key).unwrap().clone()
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let f = fixture("sess-dup").await;
        let err = f.router.register("sess-dup", f.party.clone()).await;
        assert!(matches!(err, Err(NetworkError::SessionExists(_))));
    }

    #[tokio::test]
    async fn test_unicast_is_delivered_in_order() {
        let f = fixture("sess-uni").await;
        let local_index = f.party.local_index();
        let sender_index = (0..4).find(|i| *i != local_index).unwrap();
        let sender = by_index(&f, sender_index);

        for round in ["r1", "r2"] {
            let msg = unicast(sender_index, vec![local_index], round, round.as_bytes());
            f.router
                .handle_envelope(sender.peer_id(), wire_envelope("sess-uni", &sender, &msg))
                .await;
        }

        for expected in ["r1", "r2"] {
            match f.handle.recv().await {
                InboundItem::Wire(v) => {
                    assert_eq!(v.message.round, expected);
                    assert_eq!(v.from_pub_key, sender.pub_key());
                }
                other => panic!("expected wire, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_needs_threshold_confirms() {
        let f = fixture("sess-bc").await;
        let local_index = f.party.local_index();
        let mut others = (0..4).filter(|i| *i != local_index);
        let sender_index = others.next().unwrap();
        let confirmer_index = others.next().unwrap();
        let sender = by_index(&f, sender_index);
        let confirmer = by_index(&f, confirmer_index);

        let msg = broadcast(sender_index, "r1", b"payload");
        f.router
            .handle_envelope(sender.peer_id(), wire_envelope("sess-bc", &sender, &msg))
            .await;

        // Not delivered yet: zero confirms.
        assert!(f.handle.state.queue.lock().await.is_empty());

        let hash = msg.payload_hash();
        f.router
            .handle_envelope(
                confirmer.peer_id(),
                confirm_envelope("sess-bc", &confirmer, sender.pub_key(), "r1", &hash),
            )
            .await;

        match f.handle.recv().await {
            InboundItem::Wire(v) => assert_eq!(v.message.wire_bytes, b"payload"),
            other => panic!("expected wire, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_equivocating_broadcast_flags_the_sender() {
        let f = fixture("sess-eq").await;
        let local_index = f.party.local_index();
        let mut others = (0..4).filter(|i| *i != local_index);
        let sender_index = others.next().unwrap();
        let confirmer_index = others.next().unwrap();
        let sender = by_index(&f, sender_index);
        let confirmer = by_index(&f, confirmer_index);

        let msg = broadcast(sender_index, "r2", b"ours");
        f.router
            .handle_envelope(sender.peer_id(), wire_envelope("sess-eq", &sender, &msg))
            .await;

        // The confirmer saw different bytes from the same broadcaster.
        let other_hash = broadcast(sender_index, "r2", b"theirs").payload_hash();
        f.router
            .handle_envelope(
                confirmer.peer_id(),
                confirm_envelope("sess-eq", &confirmer, sender.pub_key(), "r2", &other_hash),
            )
            .await;

        match f.handle.recv().await {
            InboundItem::Mismatch { round, culprit } => {
                assert_eq!(round, "r2");
                assert_eq!(culprit, sender.pub_key());
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frames_from_non_members_are_dropped() {
        let f = fixture("sess-mem").await;
        let outsider = identity(99);
        let msg = broadcast(0, "r1", b"x");
        f.router
            .handle_envelope(outsider.peer_id(), wire_envelope("sess-mem", &outsider, &msg))
            .await;
        assert!(f.handle.state.queue.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_spoofed_sender_is_dropped() {
        let f = fixture("sess-spoof").await;
        let local_index = f.party.local_index();
        let sender_index = (0..4).find(|i| *i != local_index).unwrap();
        let sender = by_index(&f, sender_index);
        let imposter = by_index(&f, (0..4).filter(|i| *i != local_index).nth(1).unwrap());

        // Envelope claims `sender` but is delivered by `imposter`.
        let msg = unicast(sender_index, vec![local_index], "r1", b"x");
        f.router
            .handle_envelope(imposter.peer_id(), wire_envelope("sess-spoof", &sender, &msg))
            .await;
        assert!(f.handle.state.queue.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_later_frames_queue_behind_unconfirmed_broadcast() {
        let f = fixture("sess-ord").await;
        let local_index = f.party.local_index();
        let mut others = (0..4).filter(|i| *i != local_index);
        let sender_index = others.next().unwrap();
        let confirmer_index = others.next().unwrap();
        let sender = by_index(&f, sender_index);
        let confirmer = by_index(&f, confirmer_index);

        let bc = broadcast(sender_index, "r1", b"first");
        let uni = unicast(sender_index, vec![local_index], "r2", b"second");
        f.router
            .handle_envelope(sender.peer_id(), wire_envelope("sess-ord", &sender, &bc))
            .await;
        f.router
            .handle_envelope(sender.peer_id(), wire_envelope("sess-ord", &sender, &uni))
            .await;

        // Nothing delivered while the broadcast is unconfirmed.
        assert!(f.handle.state.queue.lock().await.is_empty());

        f.router
            .handle_envelope(
                confirmer.peer_id(),
                confirm_envelope("sess-ord", &confirmer, sender.pub_key(), "r1", &bc.payload_hash()),
            )
            .await;

        match f.handle.recv().await {
            InboundItem::Wire(v) => assert_eq!(v.message.round, "r1"),
            other => panic!("expected broadcast first, got {other:?}"),
        }
        match f.handle.recv().await {
            InboundItem::Wire(v) => assert_eq!(v.message.round, "r2"),
            other => panic!("expected held-back unicast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_early_frames_replay_on_registration() {
        let ids: Vec<Arc<NodeIdentity>> = (70..74).map(identity).collect();
        let keys: Vec<String> = ids.iter().map(|i| i.pub_key().to_string()).collect();
        let party = Party::from_pub_keys(ids[0].pub_key(), &keys, 1).unwrap();
        let router = test_router(&ids[0]).await;

        let local_index = party.local_index();
        let sender_index = (0..4).find(|i| *i != local_index).unwrap();
        let sender_key = party.member_at(sender_index).unwrap().pub_key.clone();
        let sender = ids.iter().find(|i| i.pub_key() == sender_key).unwrap().clone();

        // Frame lands before the engine registers the session.
        let msg = unicast(sender_index, vec![local_index], "r1", b"early");
        router
            .handle_envelope(sender.peer_id(), wire_envelope("sess-early", &sender, &msg))
            .await;

        let handle = router.register("sess-early", party).await.unwrap();
        match handle.recv().await {
            InboundItem::Wire(v) => assert_eq!(v.message.wire_bytes, b"early"),
            other => panic!("expected replayed frame, got {other:?}"),
        }
    }
}
