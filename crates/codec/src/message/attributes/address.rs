use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use super::Error;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum IpFamily {
    V4 = 0x01,
    V6 = 0x02,
}

/// Shared codec for MAPPED-ADDRESS-shaped attributes (RFC 5389 SS15.1) and
/// their XOR'd counterparts (RFC 5389 SS15.2): MAPPED-ADDRESS,
/// XOR-MAPPED-ADDRESS, XOR-PEER-ADDRESS, XOR-RELAYED-ADDRESS,
/// ALTERNATE-SERVER.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |0 0 0 0 0 0 0 0|    Family     |           Port                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Address (32 bits or 128 bits)                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// For the XOR'd form, X-Port is the port XOR'd with the high 16 bits of
/// the magic cookie; X-Address is the IPv4 address XOR'd with the magic
/// cookie, or for IPv6 the magic cookie concatenated with the 96-bit
/// transaction id.
#[derive(Debug, Clone, Copy)]
pub struct XAddress;

impl XAddress {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::message::attributes::address::XAddress;
    ///
    /// let xor_addr_bytes: [u8; 8] =
    ///     [0x00, 0x01, 0xfc, 0xbe, 0xe1, 0xba, 0xa4, 0x29];
    ///
    /// let addr_bytes: [u8; 8] = [0x00, 0x01, 0xdd, 0xac, 0xc0, 0xa8, 0x00, 0x6b];
    ///
    /// let transaction_id: [u8; 12] = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let source = "192.168.0.107:56748".parse().unwrap();
    ///
    /// let mut buffer = BytesMut::with_capacity(1280);
    /// XAddress::serialize(&source, &transaction_id, &mut buffer, true);
    /// assert_eq!(&xor_addr_bytes, &buffer[..]);
    ///
    /// let mut buffer = BytesMut::with_capacity(1280);
    /// XAddress::serialize(&source, &transaction_id, &mut buffer, false);
    /// assert_eq!(&addr_bytes, &buffer[..]);
    /// ```
    pub fn serialize<B: BufMut>(
        addr: &SocketAddr,
        transaction_id: &[u8],
        bytes: &mut B,
        is_xor: bool,
    ) {
        bytes.put_u8(0);

        let xor_addr = if is_xor { xor(addr, transaction_id) } else { *addr };

        bytes.put_u8(if xor_addr.is_ipv4() { IpFamily::V4 } else { IpFamily::V6 } as u8);
        bytes.put_u16(xor_addr.port());

        match xor_addr.ip() {
            IpAddr::V4(ip) => bytes.put(&ip.octets()[..]),
            IpAddr::V6(ip) => bytes.put(&ip.octets()[..]),
        }
    }

    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::attributes::address::XAddress;
    ///
    /// let xor_addr_bytes: [u8; 8] =
    ///     [0x00, 0x01, 0xfc, 0xbe, 0xe1, 0xba, 0xa4, 0x29];
    ///
    /// let addr_bytes: [u8; 8] = [0x00, 0x01, 0xdd, 0xac, 0xc0, 0xa8, 0x00, 0x6b];
    ///
    /// let transaction_id: [u8; 12] = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let source = "192.168.0.107:56748".parse().unwrap();
    ///
    /// let addr = XAddress::deserialize(&xor_addr_bytes, &transaction_id, true).unwrap();
    /// assert_eq!(addr, source);
    ///
    /// let addr = XAddress::deserialize(&addr_bytes, &transaction_id, false).unwrap();
    /// assert_eq!(addr, source);
    /// ```
    pub fn deserialize(
        mut bytes: &[u8],
        transaction_id: &[u8],
        is_xor: bool,
    ) -> Result<SocketAddr, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        // skip the reserved byte.
        bytes.advance(1);

        let family = IpFamily::try_from(bytes.get_u8()).map_err(|_| Error::InvalidInput)?;
        let port = bytes.get_u16();

        let addr = SocketAddr::new(
            match family {
                IpFamily::V4 => ipv4_from_bytes(bytes)?,
                IpFamily::V6 => ipv6_from_bytes(bytes)?,
            },
            port,
        );

        Ok(if is_xor { xor(&addr, transaction_id) } else { addr })
    }
}

pub fn ipv4_from_bytes(bytes: &[u8]) -> Result<IpAddr, Error> {
    if bytes.len() != 4 {
        return Err(Error::InvalidInput);
    }

    let bytes: [u8; 4] = bytes[..4].try_into()?;
    Ok(IpAddr::V4(bytes.into()))
}

pub fn ipv6_from_bytes(bytes: &[u8]) -> Result<IpAddr, Error> {
    if bytes.len() != 16 {
        return Err(Error::InvalidInput);
    }

    let bytes: [u8; 16] = bytes[..16].try_into()?;
    Ok(IpAddr::V6(bytes.into()))
}

/// # Test
///
/// ```
/// use turn_client_codec::message::attributes::address::xor;
///
/// let source: std::net::SocketAddr = "192.168.0.107:1".parse().unwrap();
/// let res: std::net::SocketAddr = "225.186.164.41:8467".parse().unwrap();
///
/// let transaction_id: [u8; 12] = [
///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
/// ];
///
/// assert_eq!(xor(&source, &transaction_id), res);
/// ```
pub fn xor(addr: &SocketAddr, transaction_id: &[u8]) -> SocketAddr {
    SocketAddr::new(
        match addr.ip() {
            IpAddr::V4(it) => {
                let mut octets = it.octets();
                for (i, b) in octets.iter_mut().enumerate() {
                    *b ^= (0x2112A442 >> (24 - i * 8)) as u8;
                }

                IpAddr::V4(From::from(octets))
            }
            IpAddr::V6(it) => {
                let mut octets = it.octets();
                for (i, b) in octets.iter_mut().enumerate().take(4) {
                    *b ^= (0x2112A442 >> (24 - i * 8)) as u8;
                }

                for (i, b) in octets.iter_mut().enumerate().take(16).skip(4) {
                    *b ^= transaction_id[i - 4];
                }

                IpAddr::V6(From::from(octets))
            }
        },
        addr.port() ^ (0x2112A442 >> 16) as u16,
    )
}
