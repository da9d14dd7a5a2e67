//! Exercises the TURN Harvester's CreatePermission/ChannelBind client API
//! (spec §4.8) against a fake UDP TURN server, after driving a normal
//! ALLOCATE to completion so the harvester has a relayed address to act
//! on.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;

use codec::Attributes;
use codec::message::attributes::{Lifetime, MappedAddress, XorPeerAddress, XorRelayedAddress};
use codec::message::methods::{
    ALLOCATE_REQUEST, ALLOCATE_RESPONSE, CHANNEL_BIND_REQUEST, CHANNEL_BIND_RESPONSE, CREATE_PERMISSION_REQUEST,
    CREATE_PERMISSION_RESPONSE,
};
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
async fn turn_harvester_creates_permission_and_binds_channel() {
    let server_socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let mapped: SocketAddr = "7.7.7.7:40000".parse().unwrap();
    let relayed: SocketAddr = "8.8.8.8:50000".parse().unwrap();
    let peer: SocketAddr = "9.9.9.9:9000".parse().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];

        // ALLOCATE, granted without a challenge.
        let (len, from) = server_socket.recv_from(&mut buf).await.unwrap();
        let mut attrs = Attributes::default();
        let request = Message::decode(&buf[..len], &mut attrs).unwrap();
        assert_eq!(request.method(), ALLOCATE_REQUEST);

        let mut resp = BytesMut::new();
        let mut encoder = MessageEncoder::extend(ALLOCATE_RESPONSE, &request, &mut resp);
        encoder.append::<MappedAddress>(mapped);
        encoder.append::<XorRelayedAddress>(relayed);
        encoder.append::<Lifetime>(600);
        encoder.flush(None).unwrap();
        server_socket.send_to(&resp, from).await.unwrap();

        // CreatePermission for `peer`.
        let (len, from) = server_socket.recv_from(&mut buf).await.unwrap();
        let mut attrs = Attributes::default();
        let request = Message::decode(&buf[..len], &mut attrs).unwrap();
        assert_eq!(request.method(), CREATE_PERMISSION_REQUEST);
        assert_eq!(request.get::<XorPeerAddress>(), Some(SocketAddr::new(peer.ip(), 0)));

        let mut resp = BytesMut::new();
        let mut encoder = MessageEncoder::extend(CREATE_PERMISSION_RESPONSE, &request, &mut resp);
        encoder.flush(None).unwrap();
        server_socket.send_to(&resp, from).await.unwrap();

        // ChannelBind of channel 0x4000 to `peer`.
        let (len, from) = server_socket.recv_from(&mut buf).await.unwrap();
        let mut attrs = Attributes::default();
        let request = Message::decode(&buf[..len], &mut attrs).unwrap();
        assert_eq!(request.method(), CHANNEL_BIND_REQUEST);
        assert_eq!(request.get::<XorPeerAddress>(), Some(peer));

        let mut resp = BytesMut::new();
        let mut encoder = MessageEncoder::extend(CHANNEL_BIND_RESPONSE, &request, &mut resp);
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
    assert_eq!(candidates[1].kind, CandidateKind::Relayed);
    assert_eq!(candidates[1].local.addr, relayed);

    harvester.create_permission(relayed, peer.ip()).await.unwrap();
    harvester.bind_channel(relayed, peer, 0x4000).await.unwrap();
}

#[tokio::test]
async fn create_permission_against_unknown_relayed_address_fails() {
    let config = Config::default();
    let transactions = TransactionLayer::new(&config);
    let bindings = Arc::new(BindingTable::new());
    let credentials = Arc::new(CredentialManager::new());
    let provider: Arc<dyn LongTermCredentialProvider> = Arc::new(FixedProvider);
    let server = TransportAddress::new("127.0.0.1:3478".parse().unwrap(), Transport::Udp);
    let turn_config = TurnHarvesterConfig::from(&config);

    let harvester = TurnHarvester::new(server, transactions, bindings, credentials, provider, turn_config);

    let unrelated: SocketAddr = "8.8.8.8:1".parse().unwrap();
    let result = harvester.create_permission(unrelated, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))).await;
    assert!(result.is_err());
}
