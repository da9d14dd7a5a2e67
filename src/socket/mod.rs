//! Transport Bindings (spec §4.2): bind UDP/TCP sockets in port
//! ranges, with a global binding table so the single-port demux and
//! STUN/TURN harvesters can share sockets by local `TransportAddress`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportAddress};

pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 65535;

/// A bound socket, reference-counted through the binding table. The
/// last `Arc` release drops the underlying `tokio` socket, which
/// closes the fd (spec §4.2: "the last release closes the underlying
/// socket").
pub enum SocketWrapper {
    Udp(UdpSocket),
    /// A listening TCP socket (the Host candidate's passive side); new
    /// inbound connections are handled by the TCP Listener (spec
    /// §4.12), not here.
    Tcp(TcpListener),
}

impl SocketWrapper {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Self::Udp(s) => s.local_addr(),
            Self::Tcp(s) => s.local_addr(),
        }
    }

    pub fn as_udp(&self) -> Option<&UdpSocket> {
        match self {
            Self::Udp(s) => Some(s),
            Self::Tcp(_) => None,
        }
    }

    pub fn as_tcp_listener(&self) -> Option<&TcpListener> {
        match self {
            Self::Tcp(s) => Some(s),
            Self::Udp(_) => None,
        }
    }
}

/// Process-wide table mapping a local `TransportAddress` to its live
/// socket wrapper, so a second bind request for the same address
/// returns the existing one (spec §4.2: "mandatory for the single-port
/// demultiplexer").
#[derive(Default)]
pub struct BindingTable {
    sockets: Mutex<HashMap<TransportAddress, Weak<SocketWrapper>>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live wrapper for `addr` without binding a new one.
    pub fn get(&self, addr: &TransportAddress) -> Option<Arc<SocketWrapper>> {
        let guard = self.sockets.lock();
        guard.get(addr).and_then(Weak::upgrade)
    }

    fn insert(&self, addr: TransportAddress, wrapper: &Arc<SocketWrapper>) {
        self.sockets.lock().insert(addr, Arc::downgrade(wrapper));
    }

    /// Bind (or return the already-bound) UDP socket for `local_ip` at
    /// a single fixed `port`. Used by the single-port demux (spec
    /// §4.11) and wildcard binds (spec §4.2: `BIND_WILDCARD`).
    pub async fn bind_udp_fixed(&self, local_ip: IpAddr, port: u16) -> Result<Arc<SocketWrapper>> {
        let addr = TransportAddress::new(SocketAddr::new(local_ip, port), Transport::Udp);
        if let Some(existing) = self.get(&addr) {
            return Ok(existing);
        }

        let socket = UdpSocket::bind(addr.addr).await?;
        let wrapper = Arc::new(SocketWrapper::Udp(socket));
        self.insert(addr, &wrapper);
        Ok(wrapper)
    }

    /// Port-range bind search (spec §4.2): try `preferred` first, then
    /// increment, wrapping from `max` back to `min`, giving up after
    /// `retries` attempts.
    pub async fn bind_udp_range(
        &self,
        local_ip: IpAddr,
        preferred: u16,
        min: u16,
        max: u16,
        retries: u32,
    ) -> Result<Arc<SocketWrapper>> {
        validate_port_range(preferred, min, max)?;

        let mut port = preferred;
        let mut attempts = 0u32;

        loop {
            let addr = TransportAddress::new(SocketAddr::new(local_ip, port), Transport::Udp);
            if let Some(existing) = self.get(&addr) {
                return Ok(existing);
            }

            match UdpSocket::bind(addr.addr).await {
                Ok(socket) => {
                    let wrapper = Arc::new(SocketWrapper::Udp(socket));
                    self.insert(addr, &wrapper);
                    return Ok(wrapper);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    attempts += 1;
                    if attempts >= retries {
                        return Err(Error::PortsExhausted { addr: addr.addr, transport: Transport::Udp });
                    }
                    port = if port >= max { min } else { port + 1 };
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Same search for a listening TCP socket.
    pub async fn bind_tcp_range(
        &self,
        local_ip: IpAddr,
        preferred: u16,
        min: u16,
        max: u16,
        retries: u32,
    ) -> Result<Arc<SocketWrapper>> {
        validate_port_range(preferred, min, max)?;

        let mut port = preferred;
        let mut attempts = 0u32;

        loop {
            let addr = TransportAddress::new(SocketAddr::new(local_ip, port), Transport::Tcp);
            if let Some(existing) = self.get(&addr) {
                return Ok(existing);
            }

            match TcpListener::bind(addr.addr).await {
                Ok(listener) => {
                    let wrapper = Arc::new(SocketWrapper::Tcp(listener));
                    self.insert(addr, &wrapper);
                    return Ok(wrapper);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    attempts += 1;
                    if attempts >= retries {
                        return Err(Error::PortsExhausted { addr: addr.addr, transport: Transport::Tcp });
                    }
                    port = if port >= max { min } else { port + 1 };
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// `preferred == 0` is the "let the OS assign an ephemeral port"
/// sentinel used by harvesters that don't care which port they land
/// on; it bypasses the preferred-in-range check but `min`/`max` still
/// have to describe a valid 1024-65535 range.
fn validate_port_range(preferred: u16, min: u16, max: u16) -> Result<()> {
    if min < MIN_PORT || max > MAX_PORT || min > max {
        return Err(Error::InvalidArgument(format!(
            "invalid port bounds: min={min} preferred={preferred} max={max}"
        )));
    }
    if preferred != 0 && (preferred < min || preferred > max) {
        return Err(Error::InvalidArgument(format!(
            "invalid port bounds: min={min} preferred={preferred} max={max}"
        )));
    }
    Ok(())
}

/// The unspecified bind address for a given family, used when
/// `BIND_WILDCARD` is set (spec §4.2).
pub fn wildcard_for(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_preferred_port_returns_same_port() {
        let table = BindingTable::new();
        let wrapper = table
            .bind_udp_range(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1024, 65535, 50)
            .await
            .unwrap();
        // port 0 lets the OS pick; verifies the happy path binds without retry.
        assert!(wrapper.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn second_bind_of_same_address_shares_wrapper() {
        let table = BindingTable::new();
        let first = table
            .bind_udp_fixed(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .unwrap();
        let port = first.local_addr().unwrap().port();

        let second = table
            .bind_udp_fixed(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn out_of_range_ports_rejected() {
        assert!(validate_port_range(1023, 1023, 1023).is_err());
        assert!(validate_port_range(5000, 1024, 65535).is_ok());
    }
}
