//! STUN Codec & Packet Classifier (spec §4.3), Transaction Layer
//! (spec §4.4), Credential Manager (spec §4.5), and the shared
//! `StunClient` value the harvesters compose.

pub mod classifier;
pub mod client;
pub mod credentials;
pub mod transaction;
