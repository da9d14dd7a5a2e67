//! Transaction Layer (spec §4.4): retransmission timers, response
//! matching, and failure/response delivery for client-side STUN/TURN
//! transactions.
//!
//! The actual socket write lives here; reading inbound datagrams and
//! routing them to the right `TransactionLayer::deliver` call is the
//! caller's job (the STUN/TURN harvesters own the read loop for their
//! host sockets), matching spec §4.4: "Clients keep a mapping
//! TransactionId->Request to correlate outcomes".

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::socket::SocketWrapper;

pub type TransactionId = [u8; 12];

/// RFC 5389 §7.2.1: non-UDP transactions time out at 39.5s.
const STREAM_TRANSACTION_TIMEOUT: Duration = Duration::from_millis(39_500);

#[derive(Debug, Clone)]
pub enum TransactionError {
    Timeout,
    Canceled,
    Io(String),
    /// A response arrived but its MESSAGE-INTEGRITY was missing or did
    /// not verify (spec §4.4: "silently discarded").
    IntegrityFailed,
}

pub type TransactionOutcome = std::result::Result<Bytes, TransactionError>;

/// Opaque caller data carried alongside a transaction so it comes back
/// attached to the outcome instead of living in a side channel. TURN's
/// CreatePermission/ChannelBind retries use this to thread the peer
/// address being requested through the retry loop (spec §3's Transaction
/// data model: "optional application data").
pub type ApplicationData = Arc<dyn Any + Send + Sync>;

/// A transaction's outcome plus whatever `application_data` was attached
/// at `send_with_data` time.
pub struct TransactionResult {
    pub outcome: TransactionOutcome,
    pub application_data: Option<ApplicationData>,
}

/// Where a transaction's request is written. UDP retransmits per spec
/// §4.4's schedule; a connected stream (TCP/TLS) writes once and
/// relies purely on the 39.5s timeout.
#[derive(Clone)]
pub enum Endpoint {
    Udp { socket: Arc<SocketWrapper>, target: SocketAddr },
    Stream { stream: Arc<tokio::sync::Mutex<TcpStream>> },
}

struct Pending {
    sender: oneshot::Sender<TransactionResult>,
    application_data: Option<ApplicationData>,
}

/// Client-side STUN/TURN transaction state machine.
pub struct TransactionLayer {
    pending: Mutex<HashMap<TransactionId, Pending>>,
    max_retrans_timer: Duration,
    max_retransmissions: u32,
}

impl TransactionLayer {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            max_retrans_timer: config.max_ctran_retrans_timer,
            max_retransmissions: config.max_ctran_retransmissions,
        })
    }

    /// Start a transaction: write `request` (whose bytes 8..20 are the
    /// 96-bit transaction id) over `endpoint`, and resolve the
    /// returned receiver with the first matching response delivered
    /// via `deliver`, or a timeout/cancellation.
    ///
    /// Each transaction id maps to at most one in-flight request (spec
    /// §3 invariant); starting a second transaction reusing an id still
    /// in `pending` replaces the first entry, which then never
    /// resolves via `deliver` and times out normally.
    pub fn send(
        self: &Arc<Self>,
        endpoint: Endpoint,
        request: Bytes,
    ) -> (TransactionId, oneshot::Receiver<TransactionResult>) {
        self.send_with_data(endpoint, request, None)
    }

    /// Same as [`Self::send`], but attaches `application_data` to the
    /// pending transaction so it is handed back alongside the outcome
    /// (spec §3: "optional application data ... used by TURN to thread a
    /// relayed-socket through the retry loop").
    pub fn send_with_data(
        self: &Arc<Self>,
        endpoint: Endpoint,
        request: Bytes,
        application_data: Option<ApplicationData>,
    ) -> (TransactionId, oneshot::Receiver<TransactionResult>) {
        let mut tx_id = [0u8; 12];
        tx_id.copy_from_slice(&request[8..20]);

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(tx_id, Pending { sender, application_data });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match endpoint {
                Endpoint::Udp { socket, target } => this.run_udp(tx_id, socket, target, request).await,
                Endpoint::Stream { stream } => this.run_stream(tx_id, stream, request).await,
            }
        });

        (tx_id, receiver)
    }

    async fn run_udp(
        self: Arc<Self>,
        tx_id: TransactionId,
        socket: Arc<SocketWrapper>,
        target: SocketAddr,
        request: Bytes,
    ) {
        let Some(udp) = socket.as_udp() else {
            self.fail(tx_id, TransactionError::Io("not a udp socket".into()));
            return;
        };

        let mut rto = Duration::from_millis(500);
        for attempt in 0..=self.max_retransmissions {
            if attempt > 0 {
                tokio::time::sleep(rto).await;
                rto = (rto * 2).min(self.max_retrans_timer);
            }

            if !self.pending.lock().contains_key(&tx_id) {
                // Already resolved (response delivered, or canceled).
                return;
            }

            if let Err(err) = udp.send_to(&request, target).await {
                self.fail(tx_id, TransactionError::Io(err.to_string()));
                return;
            }
        }

        self.fail(tx_id, TransactionError::Timeout);
    }

    async fn run_stream(
        self: Arc<Self>,
        tx_id: TransactionId,
        stream: Arc<tokio::sync::Mutex<TcpStream>>,
        request: Bytes,
    ) {
        use tokio::io::AsyncWriteExt;

        {
            let mut guard = stream.lock().await;
            if let Err(err) = guard.write_all(&request).await {
                self.fail(tx_id, TransactionError::Io(err.to_string()));
                return;
            }
        }

        tokio::time::sleep(STREAM_TRANSACTION_TIMEOUT).await;
        self.fail(tx_id, TransactionError::Timeout);
    }

    fn fail(&self, tx_id: TransactionId, err: TransactionError) {
        if let Some(pending) = self.pending.lock().remove(&tx_id) {
            let _ = pending.sender.send(TransactionResult { outcome: Err(err), application_data: pending.application_data });
        }
    }

    /// Deliver an inbound response matched by transaction id. Returns
    /// `true` if a pending transaction was resolved, `false` if no
    /// transaction with that id is outstanding (stale/duplicate/
    /// unmatched response — silently dropped per spec §4.4's integrity
    /// rule and general STUN robustness practice).
    pub fn deliver(&self, tx_id: TransactionId, response: Bytes) -> bool {
        if let Some(pending) = self.pending.lock().remove(&tx_id) {
            let _ = pending.sender.send(TransactionResult { outcome: Ok(response), application_data: pending.application_data });
            true
        } else {
            false
        }
    }

    /// Cancel all in-flight transactions (spec §5: "closing the owning
    /// harvest cancels in-flight transactions"). Idempotent.
    pub fn cancel_all(&self) {
        for (_, pending) in self.pending.lock().drain() {
            let _ = pending
                .sender
                .send(TransactionResult { outcome: Err(TransactionError::Canceled), application_data: pending.application_data });
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn cancel_all_fails_pending_transactions() {
        let config = Config::default();
        let layer = TransactionLayer::new(&config);

        let socket = Arc::new(SocketWrapper::Udp(
            tokio::net::UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap(),
        ));

        let mut request = vec![0u8; 20];
        request[8..20].copy_from_slice(b"abcdefghijkl");

        let (_, receiver) = layer.send(
            Endpoint::Udp { socket, target: "127.0.0.1:1".parse().unwrap() },
            Bytes::from(request),
        );

        layer.cancel_all();
        let result = receiver.await.unwrap();
        assert!(matches!(result.outcome, Err(TransactionError::Canceled)));
    }

    #[test]
    fn starts_with_no_in_flight_transactions() {
        let config = Config::default();
        let layer = TransactionLayer::new(&config);
        assert_eq!(layer.in_flight_count(), 0);
    }
}
