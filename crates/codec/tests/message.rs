use bytes::BytesMut;

use turn_client_codec::{
    Attributes, Decoder, DecodeResult,
    crypto::Password,
    message::{
        Message, MessageEncoder,
        attributes::{
            ErrorCode, Lifetime, Nonce, Realm, RequestedTransport, Software, UnknownAttributes,
            UserName, XorMappedAddress, XorRelayedAddress,
        },
        methods::{ALLOCATE_ERROR, ALLOCATE_REQUEST, BINDING_REQUEST, BINDING_RESPONSE},
    },
};

fn token() -> [u8; 12] {
    *b"abcdefghijkl"
}

#[test]
fn binding_request_round_trips_with_short_term_integrity() {
    let mut buf = BytesMut::new();
    let mut encoder = MessageEncoder::new(BINDING_REQUEST, &token(), &mut buf);
    encoder.append::<UserName>("frontend:backend");
    encoder.append::<Software>("ice-harvest/0.1");
    encoder
        .flush(Some(&Password::short_term("pwd")))
        .unwrap();

    let mut attrs = Attributes::default();
    let message = Message::decode(&buf, &mut attrs).unwrap();

    assert_eq!(message.method(), BINDING_REQUEST);
    assert_eq!(message.token(), &token());
    assert_eq!(message.get::<UserName>().unwrap(), "frontend:backend");
    assert_eq!(message.get::<Software>().unwrap(), "ice-harvest/0.1");
    assert!(message.checksum(&Password::short_term("pwd")).is_ok());
    assert!(message.checksum(&Password::short_term("wrong")).is_err());
}

#[test]
fn binding_response_carries_xor_mapped_address() {
    let addr = "203.0.113.5:54321".parse().unwrap();

    let mut buf = BytesMut::new();
    let mut encoder = MessageEncoder::new(BINDING_RESPONSE, &token(), &mut buf);
    encoder.append::<XorMappedAddress>(addr);
    encoder.flush(None).unwrap();

    let mut attrs = Attributes::default();
    let message = Message::decode(&buf, &mut attrs).unwrap();

    assert_eq!(message.get::<XorMappedAddress>().unwrap(), addr);
}

#[test]
fn allocate_error_reports_stale_nonce_with_realm_and_nonce() {
    let mut buf = BytesMut::new();
    let mut encoder = MessageEncoder::new(ALLOCATE_ERROR, &token(), &mut buf);
    encoder.append::<ErrorCode>(ErrorCode { code: 438, message: "Stale Nonce" });
    encoder.append::<Realm>("example.org");
    encoder.append::<Nonce>("0123456789abcdef");
    encoder.flush(None).unwrap();

    let mut attrs = Attributes::default();
    let message = Message::decode(&buf, &mut attrs).unwrap();

    assert_eq!(message.method(), ALLOCATE_ERROR);
    assert_eq!(message.get::<ErrorCode>().unwrap().code, 438);
    assert_eq!(message.get::<Realm>().unwrap(), "example.org");
    assert_eq!(message.get::<Nonce>().unwrap(), "0123456789abcdef");
}

#[test]
fn allocate_request_declares_udp_transport_and_lifetime() {
    let mut buf = BytesMut::new();
    let mut encoder = MessageEncoder::new(ALLOCATE_REQUEST, &token(), &mut buf);
    encoder.append::<RequestedTransport>(RequestedTransport::Udp);
    encoder.append::<Lifetime>(600);
    encoder.flush(None).unwrap();

    let mut attrs = Attributes::default();
    let message = Message::decode(&buf, &mut attrs).unwrap();

    assert_eq!(message.get::<RequestedTransport>().unwrap(), RequestedTransport::Udp);
    assert_eq!(message.get::<Lifetime>().unwrap(), 600);
}

#[test]
fn allocate_response_carries_relayed_address_and_verifies_with_fingerprint() {
    let relayed = "198.51.100.9:49999".parse().unwrap();

    let mut buf = BytesMut::new();
    let mut encoder = MessageEncoder::new(turn_client_codec::message::methods::ALLOCATE_RESPONSE, &token(), &mut buf);
    encoder.append::<XorRelayedAddress>(relayed);
    encoder.flush(None).unwrap();

    // FINGERPRINT was not requested (password was None), but Decoder must
    // still dispatch this as a STUN message, not ChannelData, since the
    // top two bits of a STUN header are always zero.
    let mut decoder = Decoder::default();
    match decoder.decode(&buf).unwrap() {
        DecodeResult::Message(message) => {
            assert_eq!(message.get::<XorRelayedAddress>().unwrap(), relayed);
        }
        DecodeResult::ChannelData(_) => panic!("expected a STUN message"),
    }
}

#[test]
fn unknown_attributes_lists_rejected_comprehension_required_codes() {
    let mut buf = BytesMut::new();
    let mut encoder = MessageEncoder::new(turn_client_codec::message::methods::BINDING_ERROR, &token(), &mut buf);
    encoder.append::<UnknownAttributes>(vec![0x0019, 0x0022]);
    encoder.flush(None).unwrap();

    let mut attrs = Attributes::default();
    let message = Message::decode(&buf, &mut attrs).unwrap();

    assert_eq!(message.get::<UnknownAttributes>().unwrap(), vec![0x0019, 0x0022]);
}

#[test]
fn integrity_check_fails_without_message_integrity_attribute() {
    let mut buf = BytesMut::new();
    let mut encoder = MessageEncoder::new(BINDING_REQUEST, &token(), &mut buf);
    encoder.append::<UserName>("noauth");
    encoder.flush(None).unwrap();

    let mut attrs = Attributes::default();
    let message = Message::decode(&buf, &mut attrs).unwrap();

    assert!(matches!(
        message.checksum(&Password::short_term("pwd")),
        Err(turn_client_codec::Error::NotFoundIntegrity)
    ));
}

#[test]
fn decoder_dispatches_channel_data_by_leading_bits() {
    use turn_client_codec::channel_data::ChannelData;

    let payload = [1u8, 2, 3, 4, 5];
    let mut buf = BytesMut::with_capacity(64);
    ChannelData { number: 0x4001, bytes: &payload }.encode(&mut buf);

    let mut decoder = Decoder::default();
    match decoder.decode(&buf).unwrap() {
        DecodeResult::ChannelData(data) => {
            assert_eq!(data.number(), 0x4001);
            assert_eq!(data.as_bytes(), &payload);
        }
        DecodeResult::Message(_) => panic!("expected ChannelData"),
    }
}

#[test]
fn message_size_reports_header_plus_padded_attribute_length() {
    let mut buf = BytesMut::new();
    let mut encoder = MessageEncoder::new(BINDING_REQUEST, &token(), &mut buf);
    encoder.append::<UserName>("abc");
    encoder.flush(None).unwrap();

    // "abc" is 3 bytes, padded to 4; 20-byte header + 4-byte attribute
    // header + 4-byte padded value.
    assert_eq!(Message::message_size(&buf).unwrap(), 28);
    assert_eq!(buf.len(), 28);
}

#[test]
fn long_term_credentials_use_md5_key_not_raw_password() {
    let short = Password::short_term("secret");
    let long = Password::long_term("alice", "secret", "example.org");

    let body: &[u8] = b"same content either way";
    assert_ne!(
        turn_client_codec::crypto::hmac_sha1(&short, &[body]),
        turn_client_codec::crypto::hmac_sha1(&long, &[body]),
    );
}
