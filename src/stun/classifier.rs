//! Packet classifier (spec §4.3): inspects the first bytes of an
//! inbound buffer and reports one of {STUN, TURN, DTLS, APPLICATION,
//! INVALID}.

use codec::message::methods::Method;

const MAGIC_COOKIE: [u8; 4] = 0x2112A442u32.to_be_bytes();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Stun,
    Turn,
    Dtls,
    Application,
    Invalid,
}

/// Classify an inbound datagram/segment per spec §4.3.
///
/// STUN/TURN are distinguished by method: `Binding` (and the legacy
/// shared-secret method) classify as `Stun`; `Allocate`,
/// `CreatePermission`, `ChannelBind`, `Refresh`, and the `Send`/`Data`
/// indications classify as `Turn`. ChannelData frames (the TURN
/// relayed-data framing, top two bits `01`/`10`) also classify as
/// `Turn`.
pub fn classify(bytes: &[u8]) -> PacketClass {
    if bytes.len() < 4 {
        return PacketClass::Invalid;
    }

    let flag = bytes[0] >> 6;

    // ChannelData: top two bits are 01 or 10 (RFC 5766 §11.4).
    if flag == 1 || flag == 2 {
        if bytes.len() < 4 {
            return PacketClass::Invalid;
        }
        return PacketClass::Turn;
    }

    if flag == 0 && bytes.len() >= 20 {
        let has_cookie = bytes[4..8] == MAGIC_COOKIE;
        let declared_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize + 20;
        let legacy_length_ok = declared_len == bytes.len();

        if has_cookie || legacy_length_ok {
            let method_code = u16::from_be_bytes([bytes[0], bytes[1]]);
            return match Method::try_from(method_code) {
                Ok(Method::Binding(_)) => PacketClass::Stun,
                Ok(
                    Method::Allocate(_)
                    | Method::CreatePermission(_)
                    | Method::ChannelBind(_)
                    | Method::Refresh(_)
                    | Method::SendIndication
                    | Method::DataIndication,
                ) => PacketClass::Turn,
                Err(_) => PacketClass::Invalid,
            };
        }
    }

    // DTLS record: ContentType in [20, 63] (RFC 6347 / RFC 5764 §5.1.2).
    if (20..=63).contains(&bytes[0]) {
        return PacketClass::Dtls;
    }

    PacketClass::Application
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use codec::message::{MessageEncoder, methods::{BINDING_REQUEST, ALLOCATE_REQUEST}};

    fn token() -> [u8; 12] {
        *b"abcdefghijkl"
    }

    #[test]
    fn classifies_binding_request_as_stun() {
        let mut buf = BytesMut::new();
        MessageEncoder::new(BINDING_REQUEST, &token(), &mut buf).flush(None).unwrap();
        assert_eq!(classify(&buf), PacketClass::Stun);
    }

    #[test]
    fn classifies_allocate_request_as_turn() {
        let mut buf = BytesMut::new();
        MessageEncoder::new(ALLOCATE_REQUEST, &token(), &mut buf).flush(None).unwrap();
        assert_eq!(classify(&buf), PacketClass::Turn);
    }

    #[test]
    fn classifies_dtls_record() {
        // 13-byte DTLS record header: content type 22 (handshake).
        let buf = [22u8, 0xfe, 0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(classify(&buf), PacketClass::Dtls);
    }

    #[test]
    fn short_buffer_is_invalid() {
        assert_eq!(classify(&[0u8; 2]), PacketClass::Invalid);
    }

    #[test]
    fn random_application_traffic() {
        let buf = [200u8, 1, 2, 3, 4, 5, 6, 7];
        assert_eq!(classify(&buf), PacketClass::Application);
    }
}
