pub mod address;
pub mod error;

use std::net::SocketAddr;

use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

pub use self::{
    address::{IpFamily, XAddress},
    error::ErrorType,
};

pub use crate::Error;

/// Registry of STUN/TURN attribute type codes this codec recognizes.
/// Unrecognized codes are skipped by the decoder rather than rejected
/// (RFC 5389 SS15: unknown comprehension-optional attributes are ignored).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedAddressFamily = 0x0017,
    EvenPort = 0x0018,
    RequestedTransport = 0x0019,
    DontFragment = 0x001A,
    XorMappedAddress = 0x0020,
    ReservationToken = 0x0022,
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
}

/// A STUN/TURN message attribute: a typed, length-prefixed TLV.
///
/// `serialize`/`deserialize` never see the type/length prefix or the
/// 32-bit padding; `MessageEncoder`/`Message::decode` own those.
pub trait Attribute<'a> {
    type Error: std::fmt::Debug;
    type Item;

    const TYPE: AttributeType;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, token: &[u8]);

    fn deserialize(bytes: &'a [u8], token: &[u8]) -> Result<Self::Item, Self::Error>;
}

macro_rules! str_attribute {
    ($name:ident, $kind:ident) => {
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Error = Error;
            type Item = &'a str;

            const TYPE: AttributeType = AttributeType::$kind;

            fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
                bytes.put(value.as_bytes());
            }

            fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
                Ok(std::str::from_utf8(bytes)?)
            }
        }
    };
}

str_attribute!(UserName, UserName);
str_attribute!(Realm, Realm);
str_attribute!(Nonce, Nonce);
str_attribute!(Software, Software);

pub struct MessageIntegrity;

impl<'a> Attribute<'a> for MessageIntegrity {
    type Error = Error;
    type Item = &'a [u8];

    const TYPE: AttributeType = AttributeType::MessageIntegrity;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 20 {
            return Err(Error::InvalidInput);
        }

        Ok(bytes)
    }
}

/// ERROR-CODE (RFC 5389 SS15.6). Equality compares only the numeric code,
/// matching how TURN/STUN harvesters switch on it (the reason phrase is
/// diagnostic-only).
pub struct ErrorCode<'a> {
    pub code: u16,
    pub message: &'a str,
}

impl PartialEq for ErrorCode<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for ErrorCode<'_> {}

impl From<ErrorType> for ErrorCode<'static> {
    fn from(value: ErrorType) -> Self {
        Self {
            code: {
                let packed = value as u16;
                (packed >> 8) * 100 + (packed & 0xFF)
            },
            message: value.into(),
        }
    }
}

impl<'a> Attribute<'a> for ErrorCode<'a> {
    type Error = Error;
    type Item = ErrorCode<'a>;

    const TYPE: AttributeType = AttributeType::ErrorCode;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put_u16(0);
        bytes.put_u8((value.code / 100) as u8);
        bytes.put_u8((value.code % 100) as u8);
        bytes.put(value.message.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let code = (bytes[2] as u16) * 100 + bytes[3] as u16;
        let message = std::str::from_utf8(&bytes[4..])?;
        Ok(ErrorCode { code, message })
    }
}

/// UNKNOWN-ATTRIBUTES (RFC 5389 SS15.9): the list of comprehension-required
/// attribute codes a server rejected a request for with a 420 response.
pub struct UnknownAttributes;

impl<'a> Attribute<'a> for UnknownAttributes {
    type Error = Error;
    type Item = Vec<u16>;

    const TYPE: AttributeType = AttributeType::UnknownAttributes;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        for code in value {
            bytes.put_u16(code);
        }
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        Ok(bytes.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
    }
}

macro_rules! address_attribute {
    ($name:ident, $kind:ident, $is_xor:literal) => {
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Error = Error;
            type Item = SocketAddr;

            const TYPE: AttributeType = AttributeType::$kind;

            fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, token: &[u8]) {
                XAddress::serialize(&value, token, bytes, $is_xor);
            }

            fn deserialize(bytes: &'a [u8], token: &[u8]) -> Result<Self::Item, Self::Error> {
                XAddress::deserialize(bytes, token, $is_xor)
            }
        }
    };
}

address_attribute!(MappedAddress, MappedAddress, false);
address_attribute!(XorMappedAddress, XorMappedAddress, true);
address_attribute!(XorPeerAddress, XorPeerAddress, true);
address_attribute!(XorRelayedAddress, XorRelayedAddress, true);
address_attribute!(AlternateServer, AlternateServer, false);

pub struct Fingerprint;

impl<'a> Attribute<'a> for Fingerprint {
    type Error = Error;
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Fingerprint;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put_u32(value);
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 4 {
            return Err(Error::InvalidInput);
        }

        Ok(u32::from_be_bytes(bytes[..4].try_into()?))
    }
}

pub struct Lifetime;

impl<'a> Attribute<'a> for Lifetime {
    type Error = Error;
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Lifetime;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put_u32(value);
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 4 {
            return Err(Error::InvalidInput);
        }

        Ok(u32::from_be_bytes(bytes[..4].try_into()?))
    }
}

pub struct ReservationToken;

impl<'a> Attribute<'a> for ReservationToken {
    type Error = Error;
    type Item = u64;

    const TYPE: AttributeType = AttributeType::ReservationToken;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put_u64(value);
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 8 {
            return Err(Error::InvalidInput);
        }

        Ok(u64::from_be_bytes(bytes[..8].try_into()?))
    }
}

pub struct ChannelNumber;

impl<'a> Attribute<'a> for ChannelNumber {
    type Error = Error;
    type Item = u16;

    const TYPE: AttributeType = AttributeType::ChannelNumber;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put_u16(value);
        bytes.put_u16(0);
    }

    fn deserialize(mut bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() < 2 {
            return Err(Error::InvalidInput);
        }

        Ok(bytes.get_u16())
    }
}

/// REQUESTED-TRANSPORT (RFC 5766 SS14.7): the protocol number, left-aligned
/// in a 32-bit word with 3 reserved bytes. Only UDP (17) and TCP (6) are
/// meaningful client-side values.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum RequestedTransport {
    Udp = 0x11000000,
    Tcp = 0x06000000,
}

impl<'a> Attribute<'a> for RequestedTransport {
    type Error = Error;
    type Item = RequestedTransport;

    const TYPE: AttributeType = AttributeType::RequestedTransport;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put_u32(value as u32);
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 4 {
            return Err(Error::InvalidInput);
        }

        RequestedTransport::try_from(u32::from_be_bytes(bytes[..4].try_into()?))
            .map_err(|_| Error::InvalidInput)
    }
}

/// EVEN-PORT (RFC 5766 SS14.6): one bit, plus 7 reserved bits.
pub struct EvenPort;

impl<'a> Attribute<'a> for EvenPort {
    type Error = Error;
    type Item = bool;

    const TYPE: AttributeType = AttributeType::EvenPort;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put_u8(if value { 0b1000_0000 } else { 0 });
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput);
        }

        Ok(bytes[0] & 0b1000_0000 != 0)
    }
}

pub struct RequestedAddressFamily;

impl<'a> Attribute<'a> for RequestedAddressFamily {
    type Error = Error;
    type Item = IpFamily;

    const TYPE: AttributeType = AttributeType::RequestedAddressFamily;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _token: &[u8]) {
        bytes.put_u8(value as u8);
        bytes.put_u8(0);
        bytes.put_u16(0);
    }

    fn deserialize(bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput);
        }

        IpFamily::try_from(bytes[0]).map_err(|_| Error::InvalidInput)
    }
}

/// DONT-FRAGMENT (RFC 5766 SS14.8): a zero-length flag attribute; its mere
/// presence is the signal.
pub struct DontFragment;

impl<'a> Attribute<'a> for DontFragment {
    type Error = Error;
    type Item = ();

    const TYPE: AttributeType = AttributeType::DontFragment;

    fn serialize<B: BufMut>(_value: Self::Item, _bytes: &mut B, _token: &[u8]) {}

    fn deserialize(_bytes: &'a [u8], _token: &[u8]) -> Result<Self::Item, Self::Error> {
        Ok(())
    }
}
