//! Transport and coordination layer.
//!
//! [`Communication`] owns the libp2p swarm and multiplexes the four node
//! protocols over authenticated TCP streams. On top of it sit the
//! [`PartyCoordinator`], which forms a party of live peers for a session,
//! and the [`MessageRouter`], which fans protocol rounds out to the party
//! and runs the broadcast-confirmation check on the way in.

pub mod behavior;
pub mod codec;
pub mod communication;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod router;

pub use communication::{Communication, CommunicationConfig, InboundSinks, PeerInfo};
pub use coordinator::{JoinPartyFailure, JoinPartyOutcome, PartyCoordinator};
pub use error::{NetworkError, NetworkResult};
pub use router::{InboundItem, MessageRouter, SessionHandle, VerifiedMessage};
