//! Confidentiality layer: value commitments, range proofs, output blinding
//! and payment-key signatures

pub mod commitment;
pub mod range_proof;
pub mod schnorr;
pub mod types;

pub use commitment::{
    asset_generator, balancing_factor, blind_output, commit, commitments_balance, hash_to_scalar,
    unblind_output, verify_opening, BlindedValue,
};
pub use range_proof::{prove_range, verify_range, RANGE_BITS};
pub use schnorr::{PaymentPublicKey, PaymentSecretKey, SchnorrSignature};
pub use types::{
    BlindingFactor, BlindingPublicKey, BlindingSecretKey, CommitmentOpening, RewindPayload,
    ValueCommitment, ValueRangeProof,
};
