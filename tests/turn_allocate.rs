//! End-to-end exercise of the TURN Harvester's ALLOCATE lifecycle
//! against a fake UDP TURN server that challenges with a 401 before
//! granting the allocation (spec §8 scenario 4).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;

use codec::Attributes;
use codec::message::attributes::{ErrorCode, Lifetime, MappedAddress, Nonce, Realm, UserName, XorRelayedAddress};
use codec::message::methods::{ALLOCATE_ERROR, ALLOCATE_REQUEST, ALLOCATE_RESPONSE};
use codec::message::{Message, MessageEncoder};

use ice_harvest::candidate::{Candidate, CandidateKind};
use ice_harvest::component::{Component, ComponentSink};
use ice_harvest::config::Config;
use ice_harvest::harvest::turn::{TurnHarvester, TurnHarvesterConfig};
use ice_harvest::socket::BindingTable;
use ice_harvest::stun::credentials::{CredentialManager, LongTermCredentialProvider};
use ice_harvest::stun::transaction::TransactionLayer;
use ice_harvest::transport::{Transport, TransportAddress};

struct FixedProvider;

impl LongTermCredentialProvider for FixedProvider {
    fn create_long_term_credential(&self, _realm: &str) -> Option<(String, String)> {
        Some(("turnuser".to_string(), "turnpass".to_string()))
    }
}

#[tokio::test]
async fn turn_harvest_allocates_after_401_challenge() {
    let server_socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let mapped: SocketAddr = "7.7.7.7:40000".parse().unwrap();
    let relayed: SocketAddr = "8.8.8.8:50000".parse().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];

        // First ALLOCATE: no credentials yet, challenge with 401.
        let (len, from) = server_socket.recv_from(&mut buf).await.unwrap();
        let mut attrs = Attributes::default();
        let request = Message::decode(&buf[..len], &mut attrs).unwrap();
        assert_eq!(request.method(), ALLOCATE_REQUEST);
        assert!(request.get::<UserName>().is_none());

        let mut resp = BytesMut::new();
        let mut encoder = MessageEncoder::extend(ALLOCATE_ERROR, &request, &mut resp);
        encoder.append::<ErrorCode>(ErrorCode { code: 401, message: "Unauthorized" });
        encoder.append::<Realm>("example.org");
        encoder.append::<Nonce>("n1");
        encoder.flush(None).unwrap();
        server_socket.send_to(&resp, from).await.unwrap();

        // Second ALLOCATE: long-term credentials attached, grant it.
        let (len, from) = server_socket.recv_from(&mut buf).await.unwrap();
        let mut attrs = Attributes::default();
        let request = Message::decode(&buf[..len], &mut attrs).unwrap();
        assert_eq!(request.method(), ALLOCATE_REQUEST);
        assert_eq!(request.get::<UserName>(), Some("turnuser"));
        assert_eq!(request.get::<Realm>(), Some("example.org"));
        assert_eq!(request.get::<Nonce>(), Some("n1"));

        let mut resp = BytesMut::new();
        let mut encoder = MessageEncoder::extend(ALLOCATE_RESPONSE, &request, &mut resp);
        encoder.append::<MappedAddress>(mapped);
        encoder.append::<XorRelayedAddress>(relayed);
        encoder.append::<Lifetime>(600);
        encoder.flush(None).unwrap();
        server_socket.send_to(&resp, from).await.unwrap();
    });

    let bindings = Arc::new(BindingTable::new());
    let host_wrapper = bindings.bind_udp_fixed(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();
    let host_addr = host_wrapper.local_addr().unwrap();
    let host_local = TransportAddress::new(host_addr, Transport::Udp);

    let component = Component::new(1, "ufrag", 1);
    component.add_local_candidate(Candidate::host(host_local, 1, false, 0));

    let config = Config::default();
    let transactions = TransactionLayer::new(&config);
    let credentials = Arc::new(CredentialManager::new());
    let provider: Arc<dyn LongTermCredentialProvider> = Arc::new(FixedProvider);
    let server = TransportAddress::new(server_addr, Transport::Udp);
    let turn_config = TurnHarvesterConfig::from(&config);

    let harvester = TurnHarvester::new(server, transactions, bindings, credentials, provider, turn_config);

    let candidates = harvester.harvest(&component).await.unwrap();

    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].kind, CandidateKind::ServerReflexive);
    assert_eq!(candidates[0].local.addr, mapped);
    assert_eq!(candidates[1].kind, CandidateKind::Relayed);
    assert_eq!(candidates[1].local.addr, relayed);
    assert_eq!(candidates[1].stun_server_address, Some(server_addr));
}
