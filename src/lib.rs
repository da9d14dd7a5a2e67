//! ICE candidate harvesting and STUN/TURN client subsystem (RFC 8445,
//! RFC 5389, RFC 5766).
//!
//! This crate owns the client-side half of ICE gathering: enumerating
//! local addresses, binding sockets, running STUN/TURN transactions
//! against configured servers, and turning the results into
//! [`candidate::Candidate`] values for an embedding ICE agent. The
//! agent itself, its Streams, its StunStack, and the I/O reactor that
//! drives inbound sockets are external collaborators — see
//! [`component::ComponentSink`] for the trait surface this crate calls
//! into them through.

pub mod address;
pub mod candidate;
pub mod component;
pub mod config;
pub mod error;
pub mod harvest;
pub mod socket;
pub mod stun;
pub mod transport;

pub use candidate::{Candidate, CandidateKind};
pub use component::{Component, ComponentSink};
pub use config::Config;
pub use error::{Error, Result};
pub use harvest::{Harvester, HarvesterSet, TrickleCallback};
pub use transport::{Transport, TransportAddress};
