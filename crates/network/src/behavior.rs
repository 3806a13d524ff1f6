//! Combined network behaviour.

use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, identity, ping, request_response};

use tss_types::TssProtocol;

use crate::codec::{envelope_behaviour, EnvelopeCodec};

/// One request-response behaviour per node protocol, plus identify for
/// address exchange and ping for liveness.
#[derive(NetworkBehaviour)]
pub struct TssBehaviour {
    pub join_party: request_response::Behaviour<EnvelopeCodec>,
    pub join_party_leader: request_response::Behaviour<EnvelopeCodec>,
    pub tss: request_response::Behaviour<EnvelopeCodec>,
    pub signature_notifier: request_response::Behaviour<EnvelopeCodec>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

impl TssBehaviour {
    pub fn new(rendezvous: &str, public_key: identity::PublicKey) -> Self {
        let identify = identify::Behaviour::new(identify::Config::new(
            format!("/tss/{rendezvous}/1.0.0"),
            public_key,
        ));

        Self {
            join_party: envelope_behaviour(TssProtocol::JoinParty),
            join_party_leader: envelope_behaviour(TssProtocol::JoinPartyLeader),
            tss: envelope_behaviour(TssProtocol::Tss),
            signature_notifier: envelope_behaviour(TssProtocol::SignatureNotifier),
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
        }
    }

    /// The behaviour that speaks `protocol`.
    pub fn for_protocol(
        &mut self,
        protocol: TssProtocol,
    ) -> &mut request_response::Behaviour<EnvelopeCodec> {
        match protocol {
            TssProtocol::JoinParty => &mut self.join_party,
            TssProtocol::JoinPartyLeader => &mut self.join_party_leader,
            TssProtocol::Tss => &mut self.tss,
            TssProtocol::SignatureNotifier => &mut self.signature_notifier,
        }
    }
}
