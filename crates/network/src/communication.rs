//! libp2p host and swarm task.
//!
//! [`Communication`] owns the swarm on a dedicated task and exposes a small
//! command surface to the rest of the node: send an envelope on one of the
//! four protocols, dial a peer, and query local/remote addresses. Inbound
//! requests are acknowledged on the spot and handed to per-protocol sinks;
//! the consumers behind those sinks (coordinator, router, notifier) never
//! touch the swarm directly.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use libp2p::request_response::{
    Event as RequestResponseEvent, Message as RequestResponseMessage, OutboundRequestId,
};
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, noise, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tss_types::{Envelope, MsgAck, NodeIdentity, TssProtocol};

use crate::behavior::{TssBehaviour, TssBehaviourEvent};
use crate::error::{NetworkError, NetworkResult};
use crate::metrics::{DROPPED_ENVELOPES, SEND_RETRIES};

/// Idle connections are kept warm long enough to span a whole session.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on waiting for a delivery acknowledgement, above the
/// request-response layer's own timeout.
const SEND_DEADLINE: Duration = Duration::from_secs(15);

/// Capacity of each per-protocol inbound sink.
pub const INBOUND_SINK_CAPACITY: usize = 512;

/// Transport construction parameters.
#[derive(Debug, Clone)]
pub struct CommunicationConfig {
    /// Network namespace announced via identify.
    pub rendezvous: String,
    /// TCP listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// Peers dialed at startup, bech32 address book entries included.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Extra address to announce, for nodes behind NAT.
    pub external_ip: Option<String>,
}

/// Per-protocol receivers for inbound envelopes.
pub struct InboundSinks {
    pub join_party: mpsc::Sender<(PeerId, Envelope)>,
    pub join_party_leader: mpsc::Sender<(PeerId, Envelope)>,
    pub tss: mpsc::Sender<(PeerId, Envelope)>,
    pub signature_notifier: mpsc::Sender<(PeerId, Envelope)>,
}

impl InboundSinks {
    fn for_protocol(&self, protocol: TssProtocol) -> &mpsc::Sender<(PeerId, Envelope)> {
        match protocol {
            TssProtocol::JoinParty => &self.join_party,
            TssProtocol::JoinPartyLeader => &self.join_party_leader,
            TssProtocol::Tss => &self.tss,
            TssProtocol::SignatureNotifier => &self.signature_notifier,
        }
    }
}

/// Identity and last-seen address of a connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
}

enum SwarmCommand {
    Send {
        peer: PeerId,
        protocol: TssProtocol,
        envelope: Envelope,
        done: oneshot::Sender<NetworkResult<()>>,
    },
    Dial {
        addr: Multiaddr,
    },
    ListenAddrs {
        resp: oneshot::Sender<Vec<Multiaddr>>,
    },
    KnownPeers {
        resp: oneshot::Sender<Vec<PeerInfo>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the running transport host.
pub struct Communication {
    local_peer_id: PeerId,
    cmd_tx: mpsc::UnboundedSender<SwarmCommand>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Communication {
    /// Build the host, start listening, dial the bootstrap peers, and spawn
    /// the swarm task. The transport is live when this returns.
    ///
    /// `address_events` receives `(peer_id, multiaddr)` pairs as connections
    /// are established, for address-book persistence.
    pub fn spawn(
        identity: &NodeIdentity,
        config: CommunicationConfig,
        sinks: InboundSinks,
        address_events: Option<mpsc::UnboundedSender<(String, String)>>,
    ) -> NetworkResult<Self> {
        let keypair = identity.keypair().clone();
        let local_peer_id = identity.peer_id();

        let mut swarm: Swarm<TssBehaviour> = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::ListenFailed(format!("tcp transport: {e}")))?
            .with_behaviour(|key| TssBehaviour::new(&config.rendezvous, key.public()))
            .map_err(|e| NetworkError::ListenFailed(format!("behaviour: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.port)
            .parse()
            .map_err(|e| NetworkError::ListenFailed(format!("listen addr: {e}")))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| NetworkError::ListenFailed(e.to_string()))?;

        if let Some(ip) = &config.external_ip {
            let external: Multiaddr = format!("/ip4/{}/tcp/{}", ip, config.port)
                .parse::<Multiaddr>()
                .map_err(|e| NetworkError::InvalidAddress {
                    addr: ip.clone(),
                    reason: e.to_string(),
                })?;
            swarm.add_external_address(external);
        }

        for addr in &config.bootstrap_peers {
            dial_bootstrap(&mut swarm, addr.clone());
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(swarm_loop(swarm, cmd_rx, sinks, address_events));

        info!(peer_id = %local_peer_id, "p2p host started");
        Ok(Self {
            local_peer_id,
            cmd_tx,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Deliver one envelope and wait for the receipt acknowledgement.
    /// Retries once on transient failure before giving up.
    pub async fn send_to(
        &self,
        peer: PeerId,
        protocol: TssProtocol,
        envelope: Envelope,
    ) -> NetworkResult<()> {
        if peer == self.local_peer_id {
            return Err(NetworkError::SendFailed {
                peer,
                reason: "refusing to dial self".to_string(),
            });
        }
        match self.send_once(peer, protocol, envelope.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                SEND_RETRIES.inc();
                debug!(%peer, %protocol, error = %first, "send failed, retrying once");
                self.send_once(peer, protocol, envelope).await
            }
        }
    }

    async fn send_once(
        &self,
        peer: PeerId,
        protocol: TssProtocol,
        envelope: Envelope,
    ) -> NetworkResult<()> {
        let (done, wait) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Send {
                peer,
                protocol,
                envelope,
                done,
            })
            .map_err(|_| NetworkError::HostClosed)?;
        match tokio::time::timeout(SEND_DEADLINE, wait).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::HostClosed),
            Err(_) => Err(NetworkError::SendFailed {
                peer,
                reason: "acknowledgement deadline exceeded".to_string(),
            }),
        }
    }

    /// Best-effort fan-out; per-peer results are returned for the caller to
    /// act on (retry accounting lives in `send_to`).
    pub async fn send_to_many(
        &self,
        peers: &[PeerId],
        protocol: TssProtocol,
        envelope: &Envelope,
    ) -> Vec<(PeerId, NetworkResult<()>)> {
        let sends = peers
            .iter()
            .map(|peer| async move {
                let result = self.send_to(*peer, protocol, envelope.clone()).await;
                (*peer, result)
            })
            .collect::<Vec<_>>();
        futures::future::join_all(sends).await
    }

    pub fn dial(&self, addr: Multiaddr) -> NetworkResult<()> {
        self.cmd_tx
            .send(SwarmCommand::Dial { addr })
            .map_err(|_| NetworkError::HostClosed)
    }

    pub async fn listen_addrs(&self) -> NetworkResult<Vec<Multiaddr>> {
        let (resp, wait) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::ListenAddrs { resp })
            .map_err(|_| NetworkError::HostClosed)?;
        wait.await.map_err(|_| NetworkError::HostClosed)
    }

    /// Block until the host has at least one listen address, for callers
    /// that need to advertise themselves right after startup.
    pub async fn await_listen_addr(&self) -> NetworkResult<Multiaddr> {
        for _ in 0..100 {
            if let Some(addr) = self.listen_addrs().await?.into_iter().next() {
                return Ok(addr);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(NetworkError::ListenFailed(
            "no listen address after startup".to_string(),
        ))
    }

    pub async fn known_peers(&self) -> NetworkResult<Vec<PeerInfo>> {
        let (resp, wait) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::KnownPeers { resp })
            .map_err(|_| NetworkError::HostClosed)?;
        wait.await.map_err(|_| NetworkError::HostClosed)
    }

    /// Stop the swarm task and drop all connections.
    pub async fn stop(&self) {
        let (done, wait) = oneshot::channel();
        if self.cmd_tx.send(SwarmCommand::Shutdown { done }).is_ok() {
            let _ = wait.await;
        }
        if let Some(task) = self.task.lock().ok().and_then(|mut t| t.take()) {
            let _ = task.await;
        }
        info!("p2p host stopped");
    }
}

fn dial_bootstrap(swarm: &mut Swarm<TssBehaviour>, addr: Multiaddr) {
    // A /p2p component lets us seed the peer's address for later
    // request-response dialing, not just the initial connection.
    if let Some(libp2p::multiaddr::Protocol::P2p(peer)) = addr.iter().last() {
        let mut base = addr.clone();
        base.pop();
        swarm.add_peer_address(peer, base);
    }
    if let Err(e) = swarm.dial(addr.clone()) {
        warn!(%addr, "bootstrap dial failed: {e}");
    } else {
        debug!(%addr, "dialing bootstrap peer");
    }
}

async fn swarm_loop(
    mut swarm: Swarm<TssBehaviour>,
    mut cmd_rx: mpsc::UnboundedReceiver<SwarmCommand>,
    sinks: InboundSinks,
    address_events: Option<mpsc::UnboundedSender<(String, String)>>,
) {
    // In-flight outbound requests awaiting their acknowledgement.
    let mut pending: HashMap<(TssProtocol, OutboundRequestId), oneshot::Sender<NetworkResult<()>>> =
        HashMap::new();
    // Last seen address per connected peer.
    let mut connected: HashMap<PeerId, Multiaddr> = HashMap::new();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(SwarmCommand::Send { peer, protocol, envelope, done }) => {
                        let request_id = swarm
                            .behaviour_mut()
                            .for_protocol(protocol)
                            .send_request(&peer, envelope);
                        pending.insert((protocol, request_id), done);
                    }
                    Some(SwarmCommand::Dial { addr }) => {
                        dial_bootstrap(&mut swarm, addr);
                    }
                    Some(SwarmCommand::ListenAddrs { resp }) => {
                        let _ = resp.send(swarm.listeners().cloned().collect());
                    }
                    Some(SwarmCommand::KnownPeers { resp }) => {
                        let infos = connected
                            .iter()
                            .map(|(peer, addr)| PeerInfo {
                                id: peer.to_string(),
                                address: addr.to_string(),
                            })
                            .collect();
                        let _ = resp.send(infos);
                    }
                    Some(SwarmCommand::Shutdown { done }) => {
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                }
            }
            event = swarm.select_next_some() => {
                handle_swarm_event(
                    &mut swarm,
                    event,
                    &sinks,
                    &mut pending,
                    &mut connected,
                    address_events.as_ref(),
                );
            }
        }
    }

    // Fail any senders still waiting so they do not hang on shutdown.
    for (_, done) in pending.drain() {
        let _ = done.send(Err(NetworkError::HostClosed));
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<TssBehaviour>,
    event: SwarmEvent<TssBehaviourEvent>,
    sinks: &InboundSinks,
    pending: &mut HashMap<(TssProtocol, OutboundRequestId), oneshot::Sender<NetworkResult<()>>>,
    connected: &mut HashMap<PeerId, Multiaddr>,
    address_events: Option<&mpsc::UnboundedSender<(String, String)>>,
) {
    match event {
        SwarmEvent::Behaviour(behaviour_event) => match behaviour_event {
            TssBehaviourEvent::JoinParty(ev) => {
                handle_protocol_event(swarm, TssProtocol::JoinParty, ev, sinks, pending)
            }
            TssBehaviourEvent::JoinPartyLeader(ev) => {
                handle_protocol_event(swarm, TssProtocol::JoinPartyLeader, ev, sinks, pending)
            }
            TssBehaviourEvent::Tss(ev) => {
                handle_protocol_event(swarm, TssProtocol::Tss, ev, sinks, pending)
            }
            TssBehaviourEvent::SignatureNotifier(ev) => {
                handle_protocol_event(swarm, TssProtocol::SignatureNotifier, ev, sinks, pending)
            }
            TssBehaviourEvent::Identify(identify::Event::Received { peer_id, info }) => {
                for addr in info.listen_addrs {
                    swarm.add_peer_address(peer_id, addr);
                }
            }
            TssBehaviourEvent::Identify(_) => {}
            TssBehaviourEvent::Ping(ev) => {
                if let Err(e) = ev.result {
                    trace!(peer = %ev.peer, "ping failed: {e}");
                }
            }
        },
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(%address, "listening");
        }
        SwarmEvent::ConnectionEstablished {
            peer_id, endpoint, ..
        } => {
            let addr = endpoint.get_remote_address().clone();
            debug!(peer = %peer_id, %addr, "connection established");
            connected.insert(peer_id, addr.clone());
            if let Some(events) = address_events {
                let _ = events.send((peer_id.to_string(), addr.to_string()));
            }
        }
        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
            debug!(peer = %peer_id, "connection closed: {cause:?}");
            connected.remove(&peer_id);
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            debug!(peer = ?peer_id, "outgoing connection error: {error}");
        }
        SwarmEvent::IncomingConnectionError { error, .. } => {
            debug!("incoming connection error: {error}");
        }
        _ => {}
    }
}

fn handle_protocol_event(
    swarm: &mut Swarm<TssBehaviour>,
    protocol: TssProtocol,
    event: RequestResponseEvent<Envelope, MsgAck>,
    sinks: &InboundSinks,
    pending: &mut HashMap<(TssProtocol, OutboundRequestId), oneshot::Sender<NetworkResult<()>>>,
) {
    match event {
        RequestResponseEvent::Message { peer, message } => match message {
            RequestResponseMessage::Request {
                request, channel, ..
            } => {
                // Acknowledge first so the sender is never left waiting on
                // our local dispatch.
                if swarm
                    .behaviour_mut()
                    .for_protocol(protocol)
                    .send_response(channel, MsgAck::Received)
                    .is_err()
                {
                    trace!(%peer, %protocol, "ack channel already closed");
                }
                if !request.is_well_formed() || request.protocol_id != protocol.id() {
                    DROPPED_ENVELOPES.with_label_values(&["malformed"]).inc();
                    return;
                }
                if let Err(e) = sinks.for_protocol(protocol).try_send((peer, request)) {
                    DROPPED_ENVELOPES.with_label_values(&["sink_full"]).inc();
                    warn!(%peer, %protocol, "inbound sink rejected envelope: {e}");
                }
            }
            RequestResponseMessage::Response { request_id, .. } => {
                if let Some(done) = pending.remove(&(protocol, request_id)) {
                    let _ = done.send(Ok(()));
                }
            }
        },
        RequestResponseEvent::OutboundFailure {
            peer,
            request_id,
            error,
        } => {
            if let Some(done) = pending.remove(&(protocol, request_id)) {
                let _ = done.send(Err(NetworkError::SendFailed {
                    peer,
                    reason: error.to_string(),
                }));
            }
        }
        RequestResponseEvent::InboundFailure { peer, error, .. } => {
            trace!(%peer, %protocol, "inbound failure: {error}");
        }
        RequestResponseEvent::ResponseSent { .. } => {}
    }
}
