//! Range proofs over value commitments
//!
//! The balance identity alone admits outputs committing to "negative" values
//! (group elements wrapping the scalar field), which would let a transaction
//! mint coins. Every output therefore carries a Bulletproof that its committed
//! value lies in `[0, 2^64)`. Proofs use the asset generator `H_a` as the value
//! base and `G` as the blinding base, so they cover exactly the commitments
//! produced by [`commit`](super::commit).

use crate::error::{Result, SettlementError};
use crate::types::AssetId;
use bulletproofs::{BulletproofGens, PedersenGens, RangeProof};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::CompressedRistretto;
use merlin::Transcript;
use rand::rngs::OsRng;
use std::sync::OnceLock;
use tracing::debug;

use super::commitment::{asset_generator, commit};
use super::types::{BlindingFactor, ValueCommitment, ValueRangeProof};

/// Bit width every committed amount is proven to fit in
pub const RANGE_BITS: usize = 64;

const TRANSCRIPT_LABEL: &[u8] = b"crfq/range-proof/v1";

fn bulletproof_gens() -> &'static BulletproofGens {
    static GENS: OnceLock<BulletproofGens> = OnceLock::new();
    GENS.get_or_init(|| BulletproofGens::new(RANGE_BITS, 1))
}

fn pedersen_gens(asset: &AssetId) -> PedersenGens {
    PedersenGens {
        B: asset_generator(asset),
        B_blinding: RISTRETTO_BASEPOINT_POINT,
    }
}

fn transcript(asset: &AssetId) -> Transcript {
    let mut transcript = Transcript::new(TRANSCRIPT_LABEL);
    transcript.append_message(b"asset", &asset.0);
    transcript
}

/// Prove that the commitment to `(asset, amount, blinding)` opens to a value
/// in range
pub fn prove_range(asset: &AssetId, amount: u64, blinding: &BlindingFactor) -> Result<ValueRangeProof> {
    let (proof, committed) = RangeProof::prove_single_with_rng(
        bulletproof_gens(),
        &pedersen_gens(asset),
        &mut transcript(asset),
        amount,
        &blinding.0,
        RANGE_BITS,
        &mut OsRng,
    )
    .map_err(|e| SettlementError::Blinding(format!("range proof generation failed: {:?}", e)))?;

    if committed.to_bytes() != commit(asset, amount, blinding).0 {
        return Err(SettlementError::Blinding(
            "range proof commits to a different value".to_string(),
        ));
    }

    let bytes = proof.to_bytes();
    debug!(asset = %asset, proof_bytes = bytes.len(), "Generated range proof");
    Ok(ValueRangeProof(bytes))
}

/// Check `proof` against `commitment` in `asset`
pub fn verify_range(asset: &AssetId, commitment: &ValueCommitment, proof: &ValueRangeProof) -> bool {
    let Ok(proof) = RangeProof::from_bytes(&proof.0) else {
        return false;
    };
    proof
        .verify_single(
            bulletproof_gens(),
            &pedersen_gens(asset),
            &mut transcript(asset),
            &CompressedRistretto(commitment.0),
            RANGE_BITS,
        )
        .is_ok()
}
