//! `Component` (spec §3) and the external collaborator traits it
//! exposes to the core (spec §6: "Consumed by the core").
//!
//! The real ICE agent, its Streams, and its StunStack are external
//! collaborators (spec §1 "OUT OF SCOPE as external collaborators").
//! This module defines the narrow trait surface the harvester pipeline
//! actually calls, so a real agent implementation can plug in without
//! the core depending on its internals.

use std::sync::Arc;

use crate::candidate::Candidate;
use crate::socket::SocketWrapper;
use crate::transport::TransportAddress;

/// `Agent` / `Component` (spec §6).
///
/// `add_local_candidate` returns `false` when the candidate was
/// rejected as redundant (spec §3: "no two Candidates may share the
/// same (address, transport) tuple").
pub trait ComponentSink: Send + Sync {
    fn add_local_candidate(&self, candidate: Candidate) -> bool;
    fn local_candidates(&self) -> Vec<Candidate>;
    fn local_ufrag(&self) -> String;
    /// Number of Components in this Component's parent Stream's parent
    /// Agent (spec §4.11: the single-port demux requires exactly one
    /// Stream with exactly one Component).
    fn agent_component_count(&self) -> usize;
    fn component_id(&self) -> u16;

    /// Take shared ownership of a host socket a harvester bound on this
    /// Component's behalf (spec §4.2: "Exclusive owner: the Component
    /// that added it"). A harvester that binds a socket for a Host
    /// Candidate calls this alongside `add_local_candidate` so the
    /// `BindingTable`'s `Weak` entry stays resolvable for the
    /// Component's lifetime rather than dropping the instant the
    /// harvest call returns. Default: drop it immediately, for an
    /// embedding agent that manages socket lifetime some other way.
    fn retain_socket(&self, _socket: Arc<SocketWrapper>) {}

    /// Hand off a TCP channel whose first STUN Binding Request has
    /// been fully read off the wire (spec §4.12). `pushback` is that
    /// first RFC 4571 frame's payload, already consumed from `stream`,
    /// so the owner can replay it before continuing to read. Default:
    /// log and drop the channel — relaying it onward (DTLS, media) is
    /// an external collaborator's concern (spec §1 Non-goals).
    fn accept_tcp_channel(&self, _stream: tokio::net::TcpStream, ufrag: String, _pushback: Vec<u8>) {
        log::info!("tcp channel handed off for ufrag {ufrag} with no registered handler");
    }
}

/// In-process `Component` owning an ordered candidate set behind a
/// lock, suitable for use directly by tests or a minimal embedding
/// agent. A production agent will usually implement `ComponentSink`
/// over its own richer type instead.
pub struct Component {
    id: u16,
    ufrag: String,
    candidates: parking_lot::Mutex<Vec<Candidate>>,
    sibling_components: usize,
    /// Host sockets handed off via `retain_socket`, kept alive until
    /// this `Component` itself is dropped.
    sockets: parking_lot::Mutex<Vec<Arc<SocketWrapper>>>,
}

impl Component {
    pub fn new(id: u16, ufrag: impl Into<String>, sibling_components: usize) -> Self {
        Self {
            id,
            ufrag: ufrag.into(),
            candidates: parking_lot::Mutex::new(Vec::new()),
            sibling_components,
            sockets: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl ComponentSink for Component {
    fn add_local_candidate(&self, candidate: Candidate) -> bool {
        let mut guard = self.candidates.lock();
        let duplicate = guard
            .iter()
            .any(|c| c.local.addr == candidate.local.addr && c.local.transport == candidate.local.transport);
        if duplicate {
            return false;
        }
        guard.push(candidate);
        true
    }

    fn local_candidates(&self) -> Vec<Candidate> {
        self.candidates.lock().clone()
    }

    fn local_ufrag(&self) -> String {
        self.ufrag.clone()
    }

    fn agent_component_count(&self) -> usize {
        self.sibling_components
    }

    fn component_id(&self) -> u16 {
        self.id
    }

    fn retain_socket(&self, socket: Arc<SocketWrapper>) {
        self.sockets.lock().push(socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Candidate;
    use crate::transport::{Transport, TransportAddress};

    #[test]
    fn duplicate_address_transport_is_rejected() {
        let c = Component::new(1, "ufrag", 1);
        let addr = TransportAddress::new("10.0.0.1:5000".parse().unwrap(), Transport::Udp);
        let cand = Candidate::host(addr, 1, false, 0);

        assert!(c.add_local_candidate(cand.clone()));
        assert!(!c.add_local_candidate(cand));
        assert_eq!(c.local_candidates().len(), 1);
    }
}
