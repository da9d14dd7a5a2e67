//! `StunClient` (design notes §9): the shared retransmit/challenge/
//! integrity logic each harvester variant composes by method call
//! instead of inheriting from an `AbstractCandidateHarvester` chain.

use std::sync::Arc;

use bytes::Bytes;

use codec::Attributes;
use codec::crypto::Password;
use codec::message::Message;
use codec::message::attributes::{ErrorCode, Nonce, Realm};

use crate::stun::transaction::{Endpoint, TransactionError, TransactionLayer};

/// The result of one single-attempt request, before the caller's
/// challenge-retry policy (spec §4.5) decides what to do next.
pub enum Outcome {
    Success(Bytes),
    /// 401 Unauthorized carrying REALM + NONCE.
    Unauthorized { realm: String, nonce: String },
    /// 438 Stale Nonce carrying an updated NONCE.
    StaleNonce { nonce: String },
    /// Any other error response.
    ErrorResponse { code: u16, message: String },
    Failed(TransactionError),
}

pub struct StunClient {
    transactions: Arc<TransactionLayer>,
}

impl StunClient {
    pub fn new(transactions: Arc<TransactionLayer>) -> Self {
        Self { transactions }
    }

    /// Cancel every in-flight transaction this client has started
    /// (spec §5: "closing the owning harvest cancels in-flight
    /// transactions"). Idempotent.
    pub fn close(&self) {
        self.transactions.cancel_all();
    }

    /// Send `request` once over `endpoint` and classify the outcome.
    /// When `verify` is set (the request carried USERNAME +
    /// MESSAGE-INTEGRITY), a success response's MESSAGE-INTEGRITY is
    /// checked and a missing/failing one is treated as
    /// `Outcome::Failed(TransactionError::IntegrityFailed)` (spec
    /// §4.4).
    pub async fn send_once(&self, endpoint: Endpoint, request: Bytes, verify: Option<&Password>) -> Outcome {
        let (_, receiver) = self.transactions.send(endpoint, request);

        let bytes = match receiver.await {
            Ok(result) => match result.outcome {
                Ok(bytes) => bytes,
                Err(err) => return Outcome::Failed(err),
            },
            Err(_) => return Outcome::Failed(TransactionError::Canceled),
        };

        Self::classify(bytes, verify)
    }

    fn classify(bytes: Bytes, verify: Option<&Password>) -> Outcome {
        let mut attrs = Attributes::default();
        let message = match Message::decode(&bytes, &mut attrs) {
            Ok(m) => m,
            Err(err) => return Outcome::Failed(TransactionError::Io(format!("{err:?}"))),
        };

        if message.method().is_error() {
            let Some(err) = message.get::<ErrorCode>() else {
                return Outcome::ErrorResponse { code: 0, message: "missing ERROR-CODE".into() };
            };

            return match err.code {
                401 => Outcome::Unauthorized {
                    realm: message.get::<Realm>().unwrap_or("").to_string(),
                    nonce: message.get::<Nonce>().unwrap_or("").to_string(),
                },
                438 => Outcome::StaleNonce { nonce: message.get::<Nonce>().unwrap_or("").to_string() },
                code => Outcome::ErrorResponse { code, message: err.message.to_string() },
            };
        }

        if let Some(password) = verify {
            if message.checksum(password).is_err() {
                return Outcome::Failed(TransactionError::IntegrityFailed);
            }
        }

        Outcome::Success(bytes)
    }
}
