use aws_lc_rs::hmac;
use md5::{Digest, Md5};

/// The key material backing a MESSAGE-INTEGRITY check.
///
/// Short-term credentials use the password bytes directly as the HMAC
/// key (RFC 5389 SS15.4); long-term credentials use the MD5 digest of
/// `username ":" realm ":" password` (RFC 5389 SS15.4, RFC 8489 SS9.2.2).
#[derive(Debug, Clone)]
pub enum Password {
    ShortTerm(Vec<u8>),
    LongTerm([u8; 16]),
}

impl Password {
    pub fn short_term(password: &str) -> Self {
        Self::ShortTerm(password.as_bytes().to_vec())
    }

    pub fn long_term(username: &str, password: &str, realm: &str) -> Self {
        Self::LongTerm(long_term_key(username, password, realm))
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::ShortTerm(bytes) => bytes,
            Self::LongTerm(key) => key,
        }
    }
}

/// `key = MD5(username ":" realm ":" password)`, per RFC 5389 SS15.4.
///
/// # Test
///
/// ```
/// use turn_client_codec::crypto::long_term_key;
///
/// let buffer = [
///     0x3eu8, 0x2f, 0x79, 0x1e, 0x1f, 0x14, 0xd1, 0x73, 0xfc, 0x91, 0xff,
///     0x2f, 0x59, 0xb5, 0x0f, 0xd1,
/// ];
///
/// assert_eq!(long_term_key("panda", "raspberry", "panda"), buffer);
/// ```
pub fn long_term_key(username: &str, password: &str, realm: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update([username, realm, password].join(":"));
    hasher.finalize().into()
}

/// HMAC-SHA1 over `source`, keyed by `password`. Used for the
/// MESSAGE-INTEGRITY attribute (RFC 5389 SS15.4): always SHA-1,
/// regardless of which credential mechanism produced the key.
///
/// # Test
///
/// ```
/// use turn_client_codec::crypto::{hmac_sha1, Password};
///
/// let buffer = [
///     0x00u8, 0x03, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x64, 0x4f, 0x5a,
///     0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x00, 0x19, 0x00,
///     0x04, 0x11, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x05, 0x70, 0x61, 0x6e,
///     0x64, 0x61, 0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x09, 0x72, 0x61, 0x73,
///     0x70, 0x62, 0x65, 0x72, 0x72, 0x79, 0x00, 0x00, 0x00, 0x00, 0x15, 0x00,
///     0x10, 0x31, 0x63, 0x31, 0x33, 0x64, 0x32, 0x62, 0x32, 0x34, 0x35, 0x62,
///     0x33, 0x61, 0x37, 0x33, 0x34,
/// ];
///
/// let key = [
///     0x3eu8, 0x2f, 0x79, 0x1e, 0x1f, 0x14, 0xd1, 0x73, 0xfc, 0x91, 0xff,
///     0x2f, 0x59, 0xb5, 0x0f, 0xd1,
/// ];
///
/// let sign = [
///     0xd6u8, 0x78, 0x26, 0x99, 0x0e, 0x15, 0x56, 0x15, 0xe5, 0xf4, 0x24,
///     0x74, 0xe2, 0x3c, 0x26, 0xc5, 0xb1, 0x03, 0xb2, 0x6d,
/// ];
///
/// assert_eq!(hmac_sha1(&Password::LongTerm(key), &[&buffer]), sign);
/// ```
pub fn hmac_sha1(password: &Password, source: &[&[u8]]) -> [u8; 20] {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, password.as_bytes());
    let mut ctx = hmac::Context::with_key(&key);

    for buf in source {
        ctx.update(buf);
    }

    let mut result = [0u8; 20];
    result.copy_from_slice(ctx.sign().as_ref());
    result
}

/// CRC32 fingerprint used by the FINGERPRINT attribute (RFC 5389 SS15.5).
///
/// # Test
///
/// ```
/// use turn_client_codec::crypto::fingerprint;
///
/// assert_eq!(fingerprint(b"1"), 3498621689);
/// ```
pub fn fingerprint(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes) ^ 0x5354_554e
}
