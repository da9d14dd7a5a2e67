//! `Candidate` (spec §3): a potential local transport endpoint an ICE
//! agent may offer to its peer.

use std::net::SocketAddr;

use ahash::AHasher;
use std::hash::{Hash, Hasher};

use crate::transport::{Transport, TransportAddress};

/// TCP candidate role, RFC 6544.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpType {
    Active,
    Passive,
    So,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    Relayed,
    StaticallyMapped,
}

impl CandidateKind {
    /// RFC 8445 §5.1 type preference, used by `priority()`.
    fn type_preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::ServerReflexive | Self::StaticallyMapped => 100,
            Self::Relayed => 0,
        }
    }
}

/// A Candidate's position in the derivation chain: which Candidate it
/// was derived from. Host candidates are their own base (spec §3).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub local: TransportAddress,
    /// Index of this Candidate's base within the owning Component's
    /// candidate list. Host candidates are their own base.
    pub base: usize,
    pub foundation: String,
    pub priority: u32,
    pub kind: CandidateKind,
    pub tcp_type: Option<TcpType>,
    pub related_address: Option<SocketAddr>,
    pub ssl_flag: bool,
    /// Set iff `kind` is `ServerReflexive` or `Relayed` (spec §3
    /// invariant).
    pub stun_server_address: Option<SocketAddr>,
    /// True when this candidate was harvested from a virtual interface
    /// (spec §4.1).
    pub virtual_interface: bool,
}

impl Candidate {
    /// Construct a Host candidate: its own base, no STUN server, no
    /// related address.
    pub fn host(
        local: TransportAddress,
        component_id: u16,
        virtual_interface: bool,
        base_index: usize,
    ) -> Self {
        let mut c = Self {
            local,
            base: base_index,
            foundation: String::new(),
            priority: 0,
            kind: CandidateKind::Host,
            tcp_type: None,
            related_address: None,
            ssl_flag: false,
            stun_server_address: None,
            virtual_interface,
        };
        c.foundation = c.compute_foundation(None);
        c.priority = c.compute_priority(component_id);
        c
    }

    pub fn derived(
        kind: CandidateKind,
        local: TransportAddress,
        base_index: usize,
        component_id: u16,
        related_address: Option<SocketAddr>,
        stun_server_address: Option<SocketAddr>,
    ) -> Self {
        debug_assert!(matches!(
            (kind, stun_server_address.is_some()),
            (CandidateKind::ServerReflexive, true)
                | (CandidateKind::Relayed, true)
                | (CandidateKind::StaticallyMapped, false)
        ));

        let mut c = Self {
            local,
            base: base_index,
            foundation: String::new(),
            priority: 0,
            kind,
            tcp_type: None,
            related_address,
            ssl_flag: false,
            stun_server_address,
            virtual_interface: false,
        };
        c.foundation = c.compute_foundation(stun_server_address);
        c.priority = c.compute_priority(component_id);
        c
    }

    /// RFC 8445 §5.1: a short tag identifying candidates derivable by
    /// the same mechanism. Here: hash of (kind, base address family,
    /// transport, server address if any), truncated to 8 hex chars
    /// (well within the RFC's 32-char limit, plenty of entropy for one
    /// agent's candidate set).
    fn compute_foundation(&self, server: Option<SocketAddr>) -> String {
        let mut hasher = AHasher::default();
        std::mem::discriminant(&self.kind).hash(&mut hasher);
        self.local.addr.is_ipv4().hash(&mut hasher);
        self.local.transport.hash(&mut hasher);
        server.hash(&mut hasher);
        format!("{:08x}", hasher.finish() as u32)
    }

    /// RFC 8445 §5.1: `priority = (2^24)*type_pref + (2^8)*local_pref +
    /// (256 - component_id)`. `local_preference` here is fixed at the
    /// RFC's suggested maximum (65535 scaled to a byte, i.e. 255) since
    /// this engine harvests one candidate per (address, transport) and
    /// has no multihoming preference order to express.
    fn compute_priority(&self, component_id: u16) -> u32 {
        let type_pref = self.kind.type_preference();
        let local_pref: u32 = 255;
        (type_pref << 24) + (local_pref << 8) + (256 - u32::from(component_id).min(255))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_outranks_reflexive_outranks_relayed() {
        let addr = TransportAddress::new("10.0.0.1:1".parse().unwrap(), Transport::Udp);
        let host = Candidate::host(addr, 1, false, 0);
        let srflx = Candidate::derived(
            CandidateKind::ServerReflexive,
            TransportAddress::new("7.7.7.7:2".parse().unwrap(), Transport::Udp),
            0,
            1,
            None,
            Some("1.2.3.4:3478".parse().unwrap()),
        );
        let relay = Candidate::derived(
            CandidateKind::Relayed,
            TransportAddress::new("9.9.9.9:3".parse().unwrap(), Transport::Udp),
            0,
            1,
            None,
            Some("1.2.3.4:3478".parse().unwrap()),
        );

        assert!(host.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);
    }

    #[test]
    fn stun_server_address_invariant() {
        let addr = TransportAddress::new("10.0.0.1:1".parse().unwrap(), Transport::Udp);
        let host = Candidate::host(addr, 1, false, 0);
        assert!(host.stun_server_address.is_none());
    }
}
