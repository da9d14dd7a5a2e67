//! Error taxonomy for the harvester pipeline (spec §7).
//!
//! Each module keeps its own narrow `Error` type (matching the codec
//! crate's convention); this is the aggregate the public harvester API
//! surfaces, with `From` impls doing the narrowing-to-widening glue.

use std::fmt;
use std::net::SocketAddr;

use crate::transport::Transport;

/// Top-level error, matching the policy table in spec §7.
#[derive(Debug)]
pub enum Error {
    /// Named interface missing, all interfaces blocked, invalid port
    /// bounds. Fatal to agent/inventory construction.
    InvalidConfig(String),
    /// Port-range search exhausted its retry budget.
    PortsExhausted { addr: SocketAddr, transport: Transport },
    /// No host candidate could be bound for any local address.
    NoLocalCandidates,
    /// A STUN/TURN transaction never produced a response.
    TransactionTimeout,
    /// A STUN/TURN transaction failed for a reason other than timeout
    /// (send error, cancellation, malformed response).
    TransactionFailure(String),
    /// Long-term credential challenge retried without resolving
    /// (two 401s or two 438s for one logical request).
    AuthFailed,
    /// TURN allocation failed after exhausting the recovery table
    /// in spec §4.8.
    AllocationFailed(String),
    /// Socket I/O failure during send/recv.
    NetworkError(std::io::Error),
    /// Classifier/codec rejected a buffer.
    MalformedMessage(String),
    /// A Component's topology is incompatible with the requested
    /// harvester (e.g. single-port demux on a multi-component agent).
    UnsupportedAgentTopology,
    /// Argument out of the valid range (e.g. port bounds).
    InvalidArgument(String),
    /// The harvester this call targeted is disabled: either it exceeded
    /// its per-task timeout or threw during a prior harvest round and
    /// was marked permanently disabled for the process lifetime, or its
    /// harvest was explicitly closed.
    Disabled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::PortsExhausted { addr, transport } => {
                write!(f, "ports exhausted binding {addr} ({transport:?})")
            }
            Self::NoLocalCandidates => write!(f, "no local candidates could be bound"),
            Self::TransactionTimeout => write!(f, "transaction timed out"),
            Self::TransactionFailure(msg) => write!(f, "transaction failed: {msg}"),
            Self::AuthFailed => write!(f, "credential challenge retried without resolving"),
            Self::AllocationFailed(msg) => write!(f, "turn allocation failed: {msg}"),
            Self::NetworkError(err) => write!(f, "network error: {err}"),
            Self::MalformedMessage(msg) => write!(f, "malformed message: {msg}"),
            Self::UnsupportedAgentTopology => {
                write!(f, "agent topology unsupported for this harvester")
            }
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Disabled => write!(f, "harvester is disabled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::NetworkError(value)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::MalformedMessage(format!("{value:?}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
