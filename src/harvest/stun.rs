//! STUN Harvester (spec §4.7): one instance per STUN server. Sends a
//! Binding Request from each compatible Host Candidate's socket and
//! turns the response into a ServerReflexive Candidate.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::net::TcpStream;

use codec::Attributes;
use codec::message::attributes::{MappedAddress, XorMappedAddress};
use codec::message::methods::BINDING_REQUEST;
use codec::message::{Message, MessageEncoder};

use crate::candidate::{Candidate, CandidateKind};
use crate::component::ComponentSink;
use crate::error::Result;
use crate::harvest::HarvestStatistics;
use crate::socket::BindingTable;
use crate::stun::client::{Outcome, StunClient};
use crate::stun::transaction::Endpoint;
use crate::transport::{Transport, TransportAddress};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct StunHarvester {
    server: TransportAddress,
    client: Arc<StunClient>,
    bindings: Arc<BindingTable>,
}

impl StunHarvester {
    pub fn new(server: TransportAddress, client: Arc<StunClient>, bindings: Arc<BindingTable>) -> Self {
        Self { server, client, bindings }
    }

    pub fn identity(&self) -> String {
        format!("stun:{}", self.server)
    }

    /// Close this harvest (spec §5): cancel in-flight transactions.
    /// Idempotent.
    pub fn close(&self) {
        self.client.close();
    }

    pub async fn harvest(&self, component: &dyn ComponentSink) -> Result<Vec<Candidate>> {
        let hosts: Vec<Candidate> = component
            .local_candidates()
            .into_iter()
            .filter(|c| c.kind == CandidateKind::Host)
            .filter(|c| c.local.transport == self.server.transport)
            .filter(|c| c.local.addr.is_ipv4() == self.server.addr.is_ipv4())
            .collect();

        let component_id = component.component_id();
        let mut candidates = Vec::new();
        let mut stats = HarvestStatistics::default();

        for host in hosts {
            stats.transactions_started += 1;
            match self.probe(&host, component_id).await {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(err) => {
                    stats.transactions_failed += 1;
                    log::info!("stun harvest against {}: {err} (host {})", self.server, host.local);
                }
            }
        }

        log::debug!(
            "stun harvest against {}: {} candidates from {} transactions ({} failed)",
            self.server,
            candidates.len(),
            stats.transactions_started,
            stats.transactions_failed
        );

        Ok(candidates)
    }

    async fn probe(&self, host: &Candidate, component_id: u16) -> Result<Option<Candidate>> {
        let endpoint = self.endpoint_for(host).await?;

        let mut tx_id = [0u8; 12];
        rand::rng().fill(&mut tx_id);
        let mut buf = BytesMut::new();
        MessageEncoder::new(BINDING_REQUEST, &tx_id, &mut buf).flush(None)?;

        let outcome = self.client.send_once(endpoint, Bytes::from(buf), None).await;

        let bytes = match outcome {
            Outcome::Success(bytes) => bytes,
            Outcome::Failed(err) => {
                return Err(crate::error::Error::TransactionFailure(format!("{err:?}")));
            }
            Outcome::Unauthorized { .. } | Outcome::StaleNonce { .. } | Outcome::ErrorResponse { .. } => {
                return Ok(None);
            }
        };

        let mut attrs = Attributes::default();
        let message = Message::decode(&bytes, &mut attrs)?;

        let mapped = message
            .get::<XorMappedAddress>()
            .or_else(|| message.get::<MappedAddress>());

        let Some(mapped) = mapped else {
            return Ok(None);
        };

        let reflexive = TransportAddress::new(mapped, host.local.transport);
        Ok(Some(Candidate::derived(
            CandidateKind::ServerReflexive,
            reflexive,
            host.base,
            component_id,
            Some(host.local.addr),
            Some(self.server.addr),
        )))
    }

    async fn endpoint_for(&self, host: &Candidate) -> Result<Endpoint> {
        match host.local.transport {
            Transport::Udp => {
                let local = TransportAddress::new(host.local.addr, Transport::Udp);
                let socket = match self.bindings.get(&local) {
                    Some(s) => s,
                    None => {
                        return Err(crate::error::Error::NetworkError(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "host socket not found in binding table",
                        )));
                    }
                };
                Ok(Endpoint::Udp { socket, target: self.server.addr })
            }
            Transport::Tcp | Transport::Tls => {
                let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(self.server.addr))
                    .await
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "stun tcp connect timed out"))??;
                Ok(Endpoint::Stream { stream: Arc::new(tokio::sync::Mutex::new(stream)) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::stun::transaction::TransactionLayer;

    #[test]
    fn identity_includes_server_address() {
        let server = TransportAddress::new("1.2.3.4:3478".parse().unwrap(), Transport::Udp);
        let config = Config::default();
        let client = Arc::new(StunClient::new(TransactionLayer::new(&config)));
        let bindings = Arc::new(BindingTable::new());
        let harvester = StunHarvester::new(server, client, bindings);
        assert_eq!(harvester.identity(), "stun:1.2.3.4:3478/udp");
    }
}
