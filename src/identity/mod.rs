//! Identity & authentication

pub mod auth;
pub mod keys;

pub use auth::{canonical_payload, sign, verify, IdentityRegistry};
pub use keys::{IdentityKeypair, IdentityPublicKey, IdentitySignature, ParticipantKeyset};
