//! Single-Port UDP Demultiplexer (spec §4.11): shares one UDP port
//! across every Candidate of a single-Stream, single-Component Agent,
//! routing inbound datagrams by the local ufrag carried in the first
//! STUN Binding Request's USERNAME attribute.
//!
//! The demux only decides routing; the actual socket read loop (owned
//! by the embedding reactor, spec §1 Non-goals) is expected to call
//! [`SinglePortUdpHarvester::route_datagram`] per inbound datagram and
//! consult [`SinglePortUdpHarvester::route_for`] to find the Candidate
//! a subsequent datagram belongs to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use codec::Attributes;
use codec::message::Message;
use codec::message::attributes::UserName;
use codec::message::methods::BINDING_REQUEST;

use crate::address::AddressInventory;
use crate::candidate::Candidate;
use crate::component::ComponentSink;
use crate::error::{Error, Result};
use crate::socket::{BindingTable, SocketWrapper};
use crate::stun::classifier::{classify, PacketClass};
use crate::transport::{Transport, TransportAddress};

#[derive(Debug, Clone, Copy)]
pub struct SinglePortUdpConfig {
    pub port: u16,
}

/// Outcome of routing one inbound datagram through the demux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxOutcome {
    /// A STUN Binding Request matched a registered ufrag; `remote` is
    /// now mapped to that Candidate for subsequent datagrams.
    Installed,
    /// `remote` was already mapped by a previous STUN Binding Request.
    Routed,
    /// Not STUN, or STUN but no matching registered ufrag.
    Dropped,
}

pub struct SinglePortUdpHarvester {
    inventory: Arc<AddressInventory>,
    bindings: Arc<BindingTable>,
    config: SinglePortUdpConfig,
    candidates_by_ufrag: Mutex<HashMap<String, TransportAddress>>,
    routes: Mutex<HashMap<SocketAddr, TransportAddress>>,
    /// The shared-port sockets this harvester has bound, kept alive for
    /// its own lifetime rather than the `BindingTable`'s `Weak` entry
    /// dropping the instant a `harvest` call returns (spec §4.2).
    sockets: Mutex<Vec<Arc<SocketWrapper>>>,
}

impl SinglePortUdpHarvester {
    pub fn new(inventory: Arc<AddressInventory>, bindings: Arc<BindingTable>, config: SinglePortUdpConfig) -> Self {
        Self {
            inventory,
            bindings,
            config,
            candidates_by_ufrag: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            sockets: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> String {
        format!("single-port-udp:{}", self.config.port)
    }

    /// Route one inbound datagram (spec §4.11). The first STUN Binding
    /// Request from a new `remote` installs a route if its USERNAME's
    /// local-ufrag half matches a registered Candidate; everything
    /// else from an already-routed `remote` is just confirmed routed.
    pub fn route_datagram(&self, remote: SocketAddr, buf: &[u8]) -> DemuxOutcome {
        if self.routes.lock().contains_key(&remote) {
            return DemuxOutcome::Routed;
        }

        if classify(buf) != PacketClass::Stun {
            return DemuxOutcome::Dropped;
        }

        let mut attrs = Attributes::default();
        let Ok(message) = Message::decode(buf, &mut attrs) else {
            return DemuxOutcome::Dropped;
        };
        if message.method() != BINDING_REQUEST {
            return DemuxOutcome::Dropped;
        }

        let Some(username) = message.get::<UserName>() else {
            return DemuxOutcome::Dropped;
        };
        // USERNAME = "<remote ufrag>:<local ufrag>" (RFC 5389 short-term
        // credential convention).
        let Some((_, local_ufrag)) = username.split_once(':') else {
            return DemuxOutcome::Dropped;
        };

        let Some(local) = self.candidates_by_ufrag.lock().get(local_ufrag).copied() else {
            return DemuxOutcome::Dropped;
        };

        self.routes.lock().insert(remote, local);
        DemuxOutcome::Installed
    }

    pub fn route_for(&self, remote: &SocketAddr) -> Option<TransportAddress> {
        self.routes.lock().get(remote).copied()
    }

    /// Bind one UDP socket per allowed local address at the shared
    /// port and register `component`'s ufrag against them. Only valid
    /// for a single-Stream, single-Component Agent (spec §4.11);
    /// anything else fails with `UnsupportedAgentTopology`.
    pub async fn harvest(&self, component: &dyn ComponentSink) -> Result<Vec<Candidate>> {
        if component.agent_component_count() != 1 {
            return Err(Error::UnsupportedAgentTopology);
        }

        let entries = self.inventory.enumerate()?;
        let component_id = component.component_id();
        let ufrag = component.local_ufrag();
        let mut candidates = Vec::new();

        for entry in entries {
            let wrapper = match self.bindings.bind_udp_fixed(entry.address, self.config.port).await {
                Ok(w) => w,
                Err(err) => {
                    log::info!("single-port demux: failed to bind {}:{}: {err}", entry.address, self.config.port);
                    continue;
                }
            };

            let local_addr = match wrapper.local_addr() {
                Ok(a) => a,
                Err(_) => continue,
            };

            let local = TransportAddress::new(local_addr, Transport::Udp);
            let base_index = candidates.len();
            let candidate = Candidate::host(local, component_id, entry.virtual_interface, base_index);
            candidates.push(candidate);

            self.candidates_by_ufrag.lock().insert(ufrag.clone(), local);
            self.sockets.lock().push(wrapper);
        }

        if candidates.is_empty() {
            return Err(Error::NoLocalCandidates);
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::config::Config;
    use bytes::BytesMut;
    use codec::message::MessageEncoder;

    fn binding_request_with_username(username: &str) -> Vec<u8> {
        let tx_id = [7u8; 12];
        let mut buf = BytesMut::new();
        let mut encoder = MessageEncoder::new(BINDING_REQUEST, &tx_id, &mut buf);
        encoder.append::<UserName>(username);
        encoder.flush(None).unwrap();
        buf.to_vec()
    }

    fn harvester() -> SinglePortUdpHarvester {
        let config = Config::default();
        SinglePortUdpHarvester::new(
            Arc::new(AddressInventory::new(config).unwrap()),
            Arc::new(BindingTable::new()),
            SinglePortUdpConfig { port: 0 },
        )
    }

    #[tokio::test]
    async fn multi_component_agent_is_rejected() {
        let harvester = harvester();
        let component = Component::new(1, "ufrag", 2);
        let outcome = harvester.harvest(&component).await;
        assert!(matches!(outcome, Err(Error::UnsupportedAgentTopology)));
    }

    #[test]
    fn unmatched_ufrag_is_dropped() {
        let harvester = harvester();
        let remote: SocketAddr = "198.51.100.1:9000".parse().unwrap();
        let packet = binding_request_with_username("remote:no-such-ufrag");
        assert_eq!(harvester.route_datagram(remote, &packet), DemuxOutcome::Dropped);
    }

    #[test]
    fn matching_ufrag_installs_then_routes() {
        let harvester = harvester();
        harvester
            .candidates_by_ufrag
            .lock()
            .insert("local-ufrag".to_string(), TransportAddress::new("10.0.0.1:5000".parse().unwrap(), Transport::Udp));

        let remote: SocketAddr = "198.51.100.1:9000".parse().unwrap();
        let packet = binding_request_with_username("remote:local-ufrag");

        assert_eq!(harvester.route_datagram(remote, &packet), DemuxOutcome::Installed);
        assert_eq!(harvester.route_datagram(remote, b"anything"), DemuxOutcome::Routed);
        assert!(harvester.route_for(&remote).is_some());
    }

    #[test]
    fn non_stun_traffic_from_unrouted_remote_is_dropped() {
        let harvester = harvester();
        let remote: SocketAddr = "198.51.100.1:9000".parse().unwrap();
        assert_eq!(harvester.route_datagram(remote, b"not stun at all"), DemuxOutcome::Dropped);
    }
}
