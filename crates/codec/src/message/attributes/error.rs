use num_enum::TryFromPrimitive;

/// STUN/TURN error codes (RFC 5389 SS15.6, RFC 5766 SS15).
///
/// The numeric value packs the hundreds digit into the high byte and the
/// remainder into the low byte, matching how ERROR-CODE is laid out on
/// the wire: a reserved zero byte, a class (1-6), a number (0-99).
const fn errno(code: u16) -> u16 {
    ((code / 100) << 8) | (code % 100)
}

#[repr(u16)]
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash, TryFromPrimitive)]
pub enum ErrorType {
    TryAlternate = errno(300),
    BadRequest = errno(400),
    Unauthorized = errno(401),
    Forbidden = errno(403),
    UnknownAttribute = errno(420),
    AllocationMismatch = errno(437),
    StaleNonce = errno(438),
    AddressFamilyNotSupported = errno(440),
    WrongCredentials = errno(441),
    UnsupportedTransportAddress = errno(442),
    PeerAddressFamilyMismatch = errno(443),
    AllocationQuotaReached = errno(486),
    ServerError = errno(500),
    InsufficientCapacity = errno(508),
}

impl From<ErrorType> for &'static str {
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::attributes::error::ErrorType;
    ///
    /// let err: &'static str = ErrorType::TryAlternate.into();
    /// assert_eq!(err, "Try Alternate");
    /// ```
    #[rustfmt::skip]
    fn from(val: ErrorType) -> Self {
        match val {
            ErrorType::TryAlternate => "Try Alternate",
            ErrorType::BadRequest => "Bad Request",
            ErrorType::Unauthorized => "Unauthorized",
            ErrorType::Forbidden => "Forbidden",
            ErrorType::UnknownAttribute => "Unknown Attribute",
            ErrorType::AllocationMismatch => "Allocation Mismatch",
            ErrorType::StaleNonce => "Stale Nonce",
            ErrorType::AddressFamilyNotSupported => "Address Family not Supported",
            ErrorType::WrongCredentials => "Wrong Credentials",
            ErrorType::UnsupportedTransportAddress => "Unsupported Transport Address",
            ErrorType::PeerAddressFamilyMismatch => "Peer Address Family Mismatch",
            ErrorType::AllocationQuotaReached => "Allocation Quota Reached",
            ErrorType::ServerError => "Server Error",
            ErrorType::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}
