//! TSS server facade.
//!
//! Wires the transport, party coordinator, message router, signature
//! notifier, share storage and the external MPC library behind the two
//! public operations, keygen and keysign. Keygen runs take the exclusive
//! side of the keygen lock and keysigns the shared side, so keysigns run in
//! parallel with each other but never overlap a keygen: the library's
//! pre-parameter handling and share writing are not reentrant.

pub mod blame;
pub mod keygen;
pub mod keysign;
pub mod metrics;
pub mod mpc;
pub mod notifier;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::Multiaddr;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{info, warn};

use tss_network::{
    Communication, CommunicationConfig, InboundSinks, JoinPartyFailure, JoinPartyOutcome,
    MessageRouter, PartyCoordinator, PeerInfo,
};
use tss_network::communication::INBOUND_SINK_CAPACITY;
use tss_storage::{AddressBook, FileStateMgr, LocalStateManager};
use tss_types::{
    is_older_than, node_identity_from_secret, peer_ids_from_pub_keys, setup_bech32_prefix,
    KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse, NodeIdentity, TssConfig,
    TssError, TssResult, NEW_JOIN_PARTY_VERSION,
};

use crate::blame::BlameManager;
use crate::metrics::Monitor;
use crate::mpc::{MpcFactory, PreParams};
use crate::notifier::SignatureNotifier;

pub use crate::mpc::simulation::SimulatedMpc;
pub use crate::session::SessionState;

/// How often the monitor dumps metrics when enabled.
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// The functionality a TSS server implementation provides.
#[async_trait]
pub trait Server {
    async fn keygen(&self, req: KeygenRequest) -> TssResult<KeygenResponse>;
    async fn keysign(&self, req: KeysignRequest) -> TssResult<KeysignResponse>;
    /// Idempotent readiness signal; the transport is already live.
    fn start(&self) -> TssResult<()>;
    async fn stop(&self);
    fn local_peer_id(&self) -> String;
    fn local_pub_key(&self) -> String;
    async fn known_peers(&self) -> Vec<PeerInfo>;
}

pub struct TssServer {
    conf: TssConfig,
    identity: Arc<NodeIdentity>,
    comm: Arc<Communication>,
    coordinator: Arc<PartyCoordinator>,
    router: Arc<MessageRouter>,
    notifier: Arc<SignatureNotifier>,
    state_mgr: Arc<dyn LocalStateManager>,
    factory: Arc<dyn MpcFactory>,
    blame: BlameManager,
    monitor: Monitor,
    pre_params: PreParams,
    /// Write side: keygen. Read side: keysign.
    keygen_lock: RwLock<()>,
    stop_tx: watch::Sender<bool>,
    /// Identical keysign requests in flight attach to the first run.
    inflight_keysigns: Mutex<HashMap<String, broadcast::Sender<KeysignResponse>>>,
}

impl TssServer {
    /// Construct the node: storage, transport, coordination services and
    /// pre-parameters. The p2p host is live when this returns; `start` only
    /// signals readiness.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bootstrap_peers: Vec<Multiaddr>,
        port: u16,
        secret_key: &[u8],
        rendezvous: &str,
        base_folder: impl Into<PathBuf>,
        conf: TssConfig,
        pre_params: Option<PreParams>,
        external_ip: Option<String>,
        factory: Arc<dyn MpcFactory>,
    ) -> TssResult<Self> {
        setup_bech32_prefix("tsspub");
        let identity = Arc::new(
            node_identity_from_secret(secret_key)
                .map_err(|e| TssError::InvalidRequest(e.to_string()))?,
        );
        info!(pub_key = identity.pub_key(), peer_id = %identity.peer_id(), "node identity ready");

        let base_folder = base_folder.into();
        let state_mgr: Arc<dyn LocalStateManager> = Arc::new(
            FileStateMgr::new(&base_folder).map_err(|e| TssError::Fatal(e.to_string()))?,
        );

        // Saved peer addresses extend the configured bootstrap set.
        let mut all_bootstrap = bootstrap_peers;
        match AddressBook::load(state_mgr.as_ref()) {
            Ok(book) => {
                for addr in book.all_addresses() {
                    match addr.parse::<Multiaddr>() {
                        Ok(parsed) => all_bootstrap.push(parsed),
                        Err(e) => warn!(addr, "skipping saved address: {e}"),
                    }
                }
            }
            Err(e) => warn!("address book unreadable, starting from bootstrap only: {e}"),
        }

        let (join_party_tx, join_party_rx) = mpsc::channel(INBOUND_SINK_CAPACITY);
        let (leader_tx, leader_rx) = mpsc::channel(INBOUND_SINK_CAPACITY);
        let (tss_tx, tss_rx) = mpsc::channel(INBOUND_SINK_CAPACITY);
        let (notifier_tx, notifier_rx) = mpsc::channel(INBOUND_SINK_CAPACITY);
        let (address_tx, address_rx) = mpsc::unbounded_channel();

        let comm = Arc::new(
            Communication::spawn(
                &identity,
                CommunicationConfig {
                    rendezvous: rendezvous.to_string(),
                    port,
                    bootstrap_peers: all_bootstrap,
                    external_ip,
                },
                InboundSinks {
                    join_party: join_party_tx,
                    join_party_leader: leader_tx,
                    tss: tss_tx,
                    signature_notifier: notifier_tx,
                },
                Some(address_tx),
            )
            .map_err(|e| TssError::Fatal(e.to_string()))?,
        );
        spawn_address_book_writer(Arc::clone(&state_mgr), address_rx);

        // Pre-parameters are validated up front: a bad set is fatal at boot,
        // never discovered mid-session.
        let pre_params = match pre_params {
            Some(params) => params,
            None => factory
                .generate_pre_params(conf.pre_param_timeout)
                .map_err(|e| TssError::Fatal(e.to_string()))?,
        };
        if !pre_params.validate() {
            return Err(TssError::Fatal("invalid pre-parameters".to_string()));
        }

        let coordinator = PartyCoordinator::spawn(
            Arc::clone(&comm),
            Arc::clone(&identity),
            conf.party_timeout,
            join_party_rx,
            leader_rx,
        );
        let router = MessageRouter::spawn(Arc::clone(&comm), Arc::clone(&identity), tss_rx);
        let notifier =
            SignatureNotifier::spawn(Arc::clone(&comm), Arc::clone(&identity), notifier_rx);

        let monitor = Monitor::new(conf.enable_monitor);
        monitor.spawn_reporter(METRICS_REPORT_INTERVAL);

        let (stop_tx, _) = watch::channel(false);
        let blame = BlameManager::new(Arc::clone(&identity));

        Ok(Self {
            conf,
            identity,
            comm,
            coordinator,
            router,
            notifier,
            state_mgr,
            factory,
            blame,
            monitor,
            pre_params,
            keygen_lock: RwLock::new(()),
            stop_tx,
            inflight_keysigns: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Listen addresses of the local host, with the peer id appended.
    pub async fn listen_addrs(&self) -> TssResult<Vec<Multiaddr>> {
        let peer = self.comm.local_peer_id();
        Ok(self
            .comm
            .listen_addrs()
            .await
            .map_err(|e| TssError::Transport(e.to_string()))?
            .into_iter()
            .map(|addr| addr.with(libp2p::multiaddr::Protocol::P2p(peer)))
            .collect())
    }

    /// First listen address, for wiring nodes together in tests and tools.
    pub async fn multiaddr(&self) -> TssResult<Multiaddr> {
        let peer = self.comm.local_peer_id();
        self.comm
            .await_listen_addr()
            .await
            .map(|addr| addr.with(libp2p::multiaddr::Protocol::P2p(peer)))
            .map_err(|e| TssError::Transport(e.to_string()))
    }

    /// Run the version-selected join-party variant.
    pub(crate) async fn join_party(
        &self,
        msg_id: &str,
        version: &str,
        block_height: i64,
        participant_keys: &[String],
        threshold: usize,
    ) -> TssResult<Result<JoinPartyOutcome, JoinPartyFailure>> {
        let leaderless = is_older_than(version, NEW_JOIN_PARTY_VERSION)
            .map_err(|e| TssError::InvalidRequest(e.to_string()))?;
        let peers = peer_ids_from_pub_keys(participant_keys)
            .map_err(|e| TssError::InvalidRequest(e.to_string()))?;

        let started = std::time::Instant::now();
        let result = if leaderless {
            info!(session = msg_id, "using leaderless join party");
            self.coordinator
                .join_party_with_retry(msg_id, &peers, threshold)
                .await
        } else {
            info!(session = msg_id, "using leader-based join party");
            self.coordinator
                .join_party_with_leader(msg_id, block_height, &peers, threshold)
                .await
        };
        self.monitor.record_join_party(started.elapsed());
        Ok(result)
    }
}

#[async_trait]
impl Server for TssServer {
    async fn keygen(&self, req: KeygenRequest) -> TssResult<KeygenResponse> {
        self.run_keygen(req).await
    }

    async fn keysign(&self, req: KeysignRequest) -> TssResult<KeysignResponse> {
        self.run_keysign_deduplicated(req).await
    }

    fn start(&self) -> TssResult<()> {
        info!("tss server ready");
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.comm.stop().await;
        info!("tss server stopped");
    }

    fn local_peer_id(&self) -> String {
        self.comm.local_peer_id().to_string()
    }

    fn local_pub_key(&self) -> String {
        self.identity.pub_key().to_string()
    }

    async fn known_peers(&self) -> Vec<PeerInfo> {
        self.comm.known_peers().await.unwrap_or_default()
    }
}

/// Persist peer addresses as connections are established.
fn spawn_address_book_writer(
    state_mgr: Arc<dyn LocalStateManager>,
    mut address_rx: mpsc::UnboundedReceiver<(String, String)>,
) {
    tokio::spawn(async move {
        let mut book = match AddressBook::load(state_mgr.as_ref()) {
            Ok(book) => book,
            Err(_) => AddressBook::new(),
        };
        while let Some((peer_id, addr)) = address_rx.recv().await {
            if book.record(&peer_id, &addr) {
                if let Err(e) = book.flush(state_mgr.as_ref()) {
                    warn!("address book write failed: {e}");
                }
            }
        }
    });
}
