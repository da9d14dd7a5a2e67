//! End-to-end exercise of the STUN Harvester against a minimal fake
//! STUN server: scenario 3 of spec §8 ("STUN reflexive").

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;

use codec::Attributes;
use codec::message::attributes::XorMappedAddress;
use codec::message::methods::{BINDING_REQUEST, BINDING_RESPONSE};
use codec::message::{Message, MessageEncoder};

use ice_harvest::candidate::{Candidate, CandidateKind};
use ice_harvest::component::{Component, ComponentSink};
use ice_harvest::config::Config;
use ice_harvest::harvest::stun::StunHarvester;
use ice_harvest::socket::BindingTable;
use ice_harvest::stun::client::StunClient;
use ice_harvest::stun::transaction::TransactionLayer;
use ice_harvest::transport::{Transport, TransportAddress};

#[tokio::test]
async fn stun_harvest_produces_server_reflexive_candidate() {
    let server_socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let reflexive: SocketAddr = "7.7.7.7:40000".parse().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        let (len, from) = server_socket.recv_from(&mut buf).await.unwrap();

        let mut attrs = Attributes::default();
        let request = Message::decode(&buf[..len], &mut attrs).unwrap();
        assert_eq!(request.method(), BINDING_REQUEST);

        let mut resp = BytesMut::new();
        let mut encoder = MessageEncoder::extend(BINDING_RESPONSE, &request, &mut resp);
        encoder.append::<XorMappedAddress>(reflexive);
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
    let client = Arc::new(StunClient::new(TransactionLayer::new(&config)));
    let server = TransportAddress::new(server_addr, Transport::Udp);
    let harvester = StunHarvester::new(server, client, bindings);

    let candidates = harvester.harvest(&component).await.unwrap();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].kind, CandidateKind::ServerReflexive);
    assert_eq!(candidates[0].local.addr, reflexive);
    assert_eq!(candidates[0].stun_server_address, Some(server_addr));
}

#[tokio::test]
async fn stun_harvest_against_unreachable_server_produces_no_candidates() {
    // Port 1 on loopback: nothing listens, so the transaction times out
    // (or is refused) rather than fielding a response; the STUN harvester
    // treats this as a dropped, not fatal, transaction (spec §4.7).
    let unreachable = TransportAddress::new("127.0.0.1:1".parse().unwrap(), Transport::Udp);

    let bindings = Arc::new(BindingTable::new());
    let host_wrapper = bindings.bind_udp_fixed(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();
    let host_local = TransportAddress::new(host_wrapper.local_addr().unwrap(), Transport::Udp);

    let component = Component::new(1, "ufrag", 1);
    component.add_local_candidate(Candidate::host(host_local, 1, false, 0));

    let mut config = Config::default();
    config.max_ctran_retransmissions = 0;
    config.max_ctran_retrans_timer = std::time::Duration::from_millis(50);
    let client = Arc::new(StunClient::new(TransactionLayer::new(&config)));
    let harvester = StunHarvester::new(unreachable, client, bindings);

    let candidates = harvester.harvest(&component).await.unwrap();
    assert!(candidates.is_empty());
}
