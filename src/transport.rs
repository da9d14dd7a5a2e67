//! `TransportAddress` (spec §3): an IP address, port, and transport
//! kind. Two addresses with different transports are distinct even
//! when IP:port match.

use std::fmt;
use std::net::SocketAddr;

/// Transport kind a `TransportAddress` is bound over. A caller-facing
/// `SslTcp` alias, if one is ever needed, should map to `Tls` before
/// construction; this engine has no such alias today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Tls)
    }

    /// The TURN REQUESTED-TRANSPORT protocol number this transport maps
    /// to (spec §4.8: "UDP->17, TCP/TLS->6").
    pub fn requested_transport_protocol(self) -> u8 {
        match self {
            Self::Udp => 17,
            Self::Tcp | Self::Tls => 6,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
        })
    }
}

/// IP + port + transport. Reachability between two addresses requires
/// address-family and transport compatibility (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddress {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl TransportAddress {
    pub fn new(addr: SocketAddr, transport: Transport) -> Self {
        Self { addr, transport }
    }

    /// Whether `self` and `other` could carry traffic to one another:
    /// same address family, same transport.
    pub fn is_compatible_with(&self, other: &TransportAddress) -> bool {
        self.transport == other.transport && self.addr.is_ipv4() == other.addr.is_ipv4()
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_transports_are_distinct_addresses() {
        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let udp = TransportAddress::new(a, Transport::Udp);
        let tcp = TransportAddress::new(a, Transport::Tcp);
        assert_ne!(udp, tcp);
    }

    #[test]
    fn family_mismatch_is_incompatible() {
        let v4 = TransportAddress::new("10.0.0.1:5000".parse().unwrap(), Transport::Udp);
        let v6 = TransportAddress::new("[::1]:5000".parse().unwrap(), Transport::Udp);
        assert!(!v4.is_compatible_with(&v6));
    }
}
