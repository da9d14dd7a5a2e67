//! Mapping Harvester (spec §4.9): rewrites a Host Candidate's address
//! through a known face->mask pair (a 1:1 static NAT) into a
//! StaticallyMapped Candidate, without any wire transaction. Three
//! sources feed the (face, mask) pair: a static config pair, the AWS
//! EC2 instance metadata service, or a STUN Binding transaction run
//! once at startup.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::Rng;

use codec::Attributes;
use codec::message::attributes::{MappedAddress, XorMappedAddress};
use codec::message::methods::BINDING_REQUEST;
use codec::message::{Message, MessageEncoder};

use crate::candidate::{Candidate, CandidateKind};
use crate::component::ComponentSink;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::stun::client::{Outcome, StunClient};
use crate::stun::transaction::Endpoint;
use crate::transport::{Transport, TransportAddress};

const AWS_METADATA_TIMEOUT: Duration = Duration::from_millis(500);
const AWS_LOCAL_IPV4_URL: &str = "http://169.254.169.254/latest/meta-data/local-ipv4";
const AWS_PUBLIC_IPV4_URL: &str = "http://169.254.169.254/latest/meta-data/public-ipv4";

/// Where a Mapping Harvester's (face, mask) pair comes from.
pub enum MappingSource {
    /// `NAT_HARVESTER_LOCAL_ADDRESS` / `NAT_HARVESTER_PUBLIC_ADDRESS`.
    Static { face: IpAddr, mask: IpAddr },
    /// The AwsCandidateHarvester specialization: queries EC2 instance
    /// metadata for the local and public IPv4 addresses.
    Aws,
    /// `STUN_MAPPING_HARVESTER_ADDRESSES`: mask is discovered by a
    /// full STUN Binding transaction against `server`, run once and
    /// cached for the harvester's lifetime.
    Stun { server: TransportAddress },
}

/// Process-wide cache for the AWS specialization: the metadata service
/// is only worth probing once per process, regardless of how many
/// Mapping Harvester instances exist.
static EC2_PROBE: tokio::sync::OnceCell<Option<(IpAddr, IpAddr)>> = tokio::sync::OnceCell::const_new();

pub struct MappingHarvester {
    source: MappingSource,
    transport: Transport,
    client: Option<Arc<StunClient>>,
    cached: tokio::sync::OnceCell<Option<(IpAddr, IpAddr)>>,
    stun_discovery_failed: AtomicBool,
}

impl MappingHarvester {
    /// Static face/mask rewrite. Returns `None` when `face == mask` —
    /// a rewrite that changes nothing is discarded at construction
    /// (spec §4.9).
    pub fn new_static(face: IpAddr, mask: IpAddr, transport: Transport) -> Option<Self> {
        if face == mask {
            return None;
        }
        Some(Self {
            source: MappingSource::Static { face, mask },
            transport,
            client: None,
            cached: tokio::sync::OnceCell::new(),
            stun_discovery_failed: AtomicBool::new(false),
        })
    }

    /// Read `NAT_HARVESTER_LOCAL_ADDRESS`/`NAT_HARVESTER_PUBLIC_ADDRESS`
    /// (spec §6) and build the static variant from them. `None` if
    /// either is unset, unparseable, or equal.
    pub fn from_nat_config(config: &Config, transport: Transport) -> Option<Self> {
        let face: IpAddr = config.nat_harvester_local_address.as_ref()?.parse().ok()?;
        let mask: IpAddr = config.nat_harvester_public_address.as_ref()?.parse().ok()?;
        Self::new_static(face, mask, transport)
    }

    pub fn new_aws(transport: Transport) -> Self {
        Self {
            source: MappingSource::Aws,
            transport,
            client: None,
            cached: tokio::sync::OnceCell::new(),
            stun_discovery_failed: AtomicBool::new(false),
        }
    }

    pub fn new_stun(server: TransportAddress, client: Arc<StunClient>) -> Self {
        let transport = server.transport;
        Self {
            source: MappingSource::Stun { server },
            transport,
            client: Some(client),
            cached: tokio::sync::OnceCell::new(),
            stun_discovery_failed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> String {
        match &self.source {
            MappingSource::Static { face, mask } => format!("mapping:static:{face}->{mask}"),
            MappingSource::Aws => "mapping:aws".to_string(),
            MappingSource::Stun { server } => format!("mapping:stun:{server}"),
        }
    }

    /// Set once the harvester's STUN discovery transaction has failed
    /// (spec §4.9: "failures mark stunDiscoveryFailed=true and exclude
    /// the harvester"). Always `false` for the static/AWS sources.
    pub fn stun_discovery_failed(&self) -> bool {
        self.stun_discovery_failed.load(Ordering::Relaxed)
    }

    /// Close this harvest (spec §5): cancel the STUN-discovery
    /// transaction if one is in flight. A no-op for the static/AWS
    /// sources, which never hold a transaction client. Idempotent.
    pub fn close(&self) {
        if let Some(client) = &self.client {
            client.close();
        }
    }

    pub async fn harvest(&self, component: &dyn ComponentSink) -> Result<Vec<Candidate>> {
        let Some((face, mask)) = self.resolve().await else {
            return Ok(Vec::new());
        };

        let component_id = component.component_id();
        let mut candidates = Vec::new();

        for host in component.local_candidates().into_iter().filter(|c| c.kind == CandidateKind::Host) {
            if host.local.transport != self.transport || host.local.addr.ip() != face {
                continue;
            }

            let mapped = TransportAddress::new(
                std::net::SocketAddr::new(mask, host.local.addr.port()),
                self.transport,
            );
            candidates.push(Candidate::derived(
                CandidateKind::StaticallyMapped,
                mapped,
                host.base,
                component_id,
                None,
                None,
            ));
        }

        Ok(candidates)
    }

    async fn resolve(&self) -> Option<(IpAddr, IpAddr)> {
        match &self.source {
            MappingSource::Static { face, mask } => Some((*face, *mask)),
            MappingSource::Aws => Self::resolve_aws().await,
            MappingSource::Stun { server } => self.resolve_stun(*server).await,
        }
    }

    async fn resolve_aws() -> Option<(IpAddr, IpAddr)> {
        *EC2_PROBE.get_or_init(|| async { Self::probe_aws_metadata().await }).await
    }

    async fn probe_aws_metadata() -> Option<(IpAddr, IpAddr)> {
        let client = reqwest::Client::builder().timeout(AWS_METADATA_TIMEOUT).build().ok()?;
        let local = Self::fetch_ipv4(&client, AWS_LOCAL_IPV4_URL).await?;
        let public = Self::fetch_ipv4(&client, AWS_PUBLIC_IPV4_URL).await?;
        Some((local, public))
    }

    async fn fetch_ipv4(client: &reqwest::Client, url: &str) -> Option<IpAddr> {
        client.get(url).send().await.ok()?.text().await.ok()?.trim().parse().ok()
    }

    async fn resolve_stun(&self, server: TransportAddress) -> Option<(IpAddr, IpAddr)> {
        *self
            .cached
            .get_or_init(|| async {
                match self.discover_stun(server).await {
                    Ok(pair) => Some(pair),
                    Err(err) => {
                        self.stun_discovery_failed.store(true, Ordering::Relaxed);
                        log::info!("mapping harvester: stun discovery against {server} failed: {err}");
                        None
                    }
                }
            })
            .await
    }

    async fn discover_stun(&self, server: TransportAddress) -> Result<(IpAddr, IpAddr)> {
        let unspecified =
            if server.addr.is_ipv4() { IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED) } else { IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED) };

        let socket = tokio::net::UdpSocket::bind((unspecified, 0)).await?;
        socket.connect(server.addr).await?;
        let face = socket.local_addr()?.ip();

        let wrapper = Arc::new(crate::socket::SocketWrapper::Udp(socket));
        let client = self.client.clone().expect("stun-sourced mapping harvester always carries a StunClient");

        let mut tx_id = [0u8; 12];
        rand::rng().fill(&mut tx_id);
        let mut buf = BytesMut::new();
        MessageEncoder::new(BINDING_REQUEST, &tx_id, &mut buf).flush(None)?;

        let outcome =
            client.send_once(Endpoint::Udp { socket: wrapper, target: server.addr }, Bytes::from(buf), None).await;

        let bytes = match outcome {
            Outcome::Success(bytes) => bytes,
            Outcome::Failed(err) => return Err(Error::TransactionFailure(format!("{err:?}"))),
            Outcome::Unauthorized { .. } | Outcome::StaleNonce { .. } | Outcome::ErrorResponse { .. } => {
                return Err(Error::TransactionFailure("binding request unexpectedly challenged".into()));
            }
        };

        let mut attrs = Attributes::default();
        let message = Message::decode(&bytes, &mut attrs)?;
        let mapped = message
            .get::<XorMappedAddress>()
            .or_else(|| message.get::<MappedAddress>())
            .ok_or_else(|| Error::MalformedMessage("binding success missing mapped address".into()))?;

        Ok((face, mapped.ip()))
    }
}

/// Parse `STUN_MAPPING_HARVESTER_ADDRESSES` entries (spec §6): each is
/// `ip:port` or `ip:port:transport` (`udp`/`tcp`/`tls`, default `udp`).
/// Unparseable entries are skipped with a log line rather than failing
/// the whole list.
pub fn parse_stun_mapping_addresses(config: &Config) -> Vec<TransportAddress> {
    let Some(entries) = &config.stun_mapping_harvester_addresses else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries {
        match parse_one(entry) {
            Some(addr) => out.push(addr),
            None => log::warn!("mapping harvester: skipping unparseable STUN_MAPPING_HARVESTER_ADDRESSES entry '{entry}'"),
        }
    }
    out
}

fn parse_one(entry: &str) -> Option<TransportAddress> {
    let mut parts = entry.splitn(3, ':');
    let ip: IpAddr = parts.next()?.parse().ok()?;
    let port: u16 = parts.next()?.parse().ok()?;
    let transport = match parts.next() {
        Some("tcp") => Transport::Tcp,
        Some("tls") => Transport::Tls,
        Some("udp") | None => Transport::Udp,
        Some(_) => return None,
    };
    Some(TransportAddress::new(std::net::SocketAddr::new(ip, port), transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;

    #[test]
    fn equal_face_and_mask_is_discarded() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(MappingHarvester::new_static(addr, addr, Transport::Udp).is_none());
    }

    #[tokio::test]
    async fn static_mapping_rewrites_matching_host_candidates() {
        let face: IpAddr = "10.0.0.5".parse().unwrap();
        let mask: IpAddr = "203.0.113.9".parse().unwrap();
        let harvester = MappingHarvester::new_static(face, mask, Transport::Udp).unwrap();

        let component = Component::new(1, "ufrag", 1);
        let host = Candidate::host(TransportAddress::new("10.0.0.5:4000".parse().unwrap(), Transport::Udp), 1, false, 0);
        component.add_local_candidate(host);

        let candidates = harvester.harvest(&component).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].local.addr, "203.0.113.9:4000".parse().unwrap());
        assert_eq!(candidates[0].kind, CandidateKind::StaticallyMapped);
    }

    #[tokio::test]
    async fn non_matching_host_candidates_are_skipped() {
        let face: IpAddr = "10.0.0.5".parse().unwrap();
        let mask: IpAddr = "203.0.113.9".parse().unwrap();
        let harvester = MappingHarvester::new_static(face, mask, Transport::Udp).unwrap();

        let component = Component::new(1, "ufrag", 1);
        let host = Candidate::host(TransportAddress::new("10.0.0.6:4000".parse().unwrap(), Transport::Udp), 1, false, 0);
        component.add_local_candidate(host);

        let candidates = harvester.harvest(&component).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn parses_transport_suffixed_entries() {
        let mut config = Config::default();
        config.stun_mapping_harvester_addresses =
            Some(vec!["1.2.3.4:3478".to_string(), "5.6.7.8:3478:tcp".to_string(), "not-an-ip:1".to_string()]);

        let addrs = parse_stun_mapping_addresses(&config);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].transport, Transport::Udp);
        assert_eq!(addrs[1].transport, Transport::Tcp);
    }
}
