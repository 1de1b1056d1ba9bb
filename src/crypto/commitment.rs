//! Pedersen value commitments and output blinding
//!
//! Every confidential output commits to its amount as `C = v·H_a + r·G`, where
//! `H_a` is a per-asset generator with no known discrete log relative to `G`.
//! A transaction balances when `Σ C_in − Σ C_out − fee·H_fee` is the identity,
//! which anyone can check without learning a single amount.
//!
//! Recipients recover `(v, r)` through an ECDH between the sender's per-output
//! ephemeral key and the blinding key embedded in their confidential address.

use crate::error::{Result, SettlementError};
use crate::types::AssetId;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use sha2::{Digest, Sha512};

use super::types::{
    BlindingFactor, BlindingPublicKey, BlindingSecretKey, CommitmentOpening, RewindPayload,
    ValueCommitment,
};

const ASSET_GENERATOR_TAG: &[u8] = b"crfq/asset-generator/v1";
const REWIND_TAG: &[u8] = b"crfq/rewind/v1";

/// Hash arbitrary parts to a scalar with domain separation
pub fn hash_to_scalar(tag: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update((tag.len() as u32).to_be_bytes());
    hasher.update(tag);
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    Scalar::from_hash(hasher)
}

/// Value generator `H_a` for an asset
pub fn asset_generator(asset: &AssetId) -> RistrettoPoint {
    let mut input = Vec::with_capacity(ASSET_GENERATOR_TAG.len() + 32);
    input.extend_from_slice(ASSET_GENERATOR_TAG);
    input.extend_from_slice(&asset.0);
    RistrettoPoint::hash_from_bytes::<Sha512>(&input)
}

/// Compute `amount·H_asset + blinding·G`
pub fn commit(asset: &AssetId, amount: u64, blinding: &BlindingFactor) -> ValueCommitment {
    ValueCommitment::from_point(&commitment_point(asset, amount, blinding))
}

fn commitment_point(asset: &AssetId, amount: u64, blinding: &BlindingFactor) -> RistrettoPoint {
    Scalar::from(amount) * asset_generator(asset) + RistrettoPoint::mul_base(&blinding.0)
}

/// Verify a commitment opening
pub fn verify_opening(commitment: &ValueCommitment, opening: &CommitmentOpening) -> bool {
    commit(&opening.asset, opening.amount, &opening.blinding) == *commitment
}

/// Check `Σ inputs − Σ outputs − fee·H_fee == 0` over the group
pub fn commitments_balance(
    inputs: &[ValueCommitment],
    outputs: &[ValueCommitment],
    fee: u64,
    fee_asset: &AssetId,
) -> bool {
    let sum = |commitments: &[ValueCommitment]| -> Option<RistrettoPoint> {
        commitments
            .iter()
            .try_fold(RistrettoPoint::identity(), |acc, c| c.to_point().map(|p| acc + p))
    };

    match (sum(inputs), sum(outputs)) {
        (Some(total_in), Some(total_out)) => {
            let fee_point = Scalar::from(fee) * asset_generator(fee_asset);
            total_in - total_out - fee_point == RistrettoPoint::identity()
        }
        _ => false,
    }
}

/// Blinding factor that makes `Σ r_in = Σ r_out` once assigned to the last output
pub fn balancing_factor(inputs: &[BlindingFactor], other_outputs: &[BlindingFactor]) -> BlindingFactor {
    let total_in: Scalar = inputs.iter().map(|b| b.0).sum();
    let total_out: Scalar = other_outputs.iter().map(|b| b.0).sum();
    BlindingFactor(total_in - total_out)
}

/// An output blinded towards a recipient's blinding key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlindedValue {
    pub commitment: ValueCommitment,
    pub ephemeral_pubkey: BlindingPublicKey,
    pub rewind: RewindPayload,
}

/// Commit to `amount` and encrypt its opening so only the holder of the
/// blinding secret behind `recipient` can recover it
pub fn blind_output(
    asset: &AssetId,
    amount: u64,
    blinding: &BlindingFactor,
    recipient: &BlindingPublicKey,
) -> Result<BlindedValue> {
    let recipient_point = recipient
        .to_point()
        .ok_or_else(|| SettlementError::Blinding("invalid recipient blinding key".to_string()))?;

    let ephemeral = BlindingSecretKey::random();
    let keystream = rewind_keystream(&(ephemeral.0 * recipient_point));

    let mut plain = [0u8; 40];
    plain[..8].copy_from_slice(&amount.to_le_bytes());
    plain[8..].copy_from_slice(&blinding.to_bytes());

    let mut payload = [0u8; 40];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = plain[i] ^ keystream[i];
    }

    Ok(BlindedValue {
        commitment: commit(asset, amount, blinding),
        ephemeral_pubkey: ephemeral.public_key(),
        rewind: RewindPayload(payload),
    })
}

/// Recover the opening of a blinded output; fails if the output was not
/// blinded towards `secret` or the payload does not match the commitment
pub fn unblind_output(
    asset: &AssetId,
    commitment: &ValueCommitment,
    ephemeral_pubkey: &BlindingPublicKey,
    rewind: &RewindPayload,
    secret: &BlindingSecretKey,
) -> Result<CommitmentOpening> {
    let ephemeral_point = ephemeral_pubkey
        .to_point()
        .ok_or_else(|| SettlementError::Blinding("invalid ephemeral key".to_string()))?;
    let keystream = rewind_keystream(&(secret.0 * ephemeral_point));

    let mut plain = [0u8; 40];
    for (i, byte) in plain.iter_mut().enumerate() {
        *byte = rewind.0[i] ^ keystream[i];
    }

    let mut amount_bytes = [0u8; 8];
    amount_bytes.copy_from_slice(&plain[..8]);
    let mut blinding_bytes = [0u8; 32];
    blinding_bytes.copy_from_slice(&plain[8..]);

    let blinding = BlindingFactor::from_canonical_bytes(blinding_bytes)
        .ok_or_else(|| SettlementError::Blinding("output not blinded to this key".to_string()))?;

    let opening = CommitmentOpening {
        asset: *asset,
        amount: u64::from_le_bytes(amount_bytes),
        blinding,
    };

    if !verify_opening(commitment, &opening) {
        return Err(SettlementError::Blinding(
            "rewound opening does not match commitment".to_string(),
        ));
    }

    Ok(opening)
}

fn rewind_keystream(shared: &RistrettoPoint) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(REWIND_TAG);
    hasher.update(shared.compress().as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(label: &str) -> AssetId {
        AssetId::from_label(label)
    }

    #[test]
    fn test_commitment_verification() {
        let blinding = BlindingFactor::random();
        let commitment = commit(&asset("USDT"), 10_000, &blinding);

        let opening = CommitmentOpening {
            asset: asset("USDT"),
            amount: 10_000,
            blinding,
        };
        assert!(verify_opening(&commitment, &opening));
    }

    #[test]
    fn test_commitment_verification_fails_wrong_amount() {
        let blinding = BlindingFactor::random();
        let commitment = commit(&asset("USDT"), 10_000, &blinding);

        let wrong = CommitmentOpening {
            asset: asset("USDT"),
            amount: 8_000,
            blinding,
        };
        assert!(!verify_opening(&commitment, &wrong));
    }

    #[test]
    fn test_commitment_verification_fails_wrong_asset() {
        let blinding = BlindingFactor::random();
        let commitment = commit(&asset("USDT"), 10_000, &blinding);

        let wrong = CommitmentOpening {
            asset: asset("L-BTC"),
            amount: 10_000,
            blinding,
        };
        assert!(!verify_opening(&commitment, &wrong));
    }

    #[test]
    fn test_commitments_hide_equal_amounts() {
        let a = commit(&asset("USDT"), 500, &BlindingFactor::random());
        let b = commit(&asset("USDT"), 500, &BlindingFactor::random());
        assert_ne!(a, b);
    }

    #[test]
    fn test_balance_with_fee_and_two_assets() {
        let usdt = asset("USDT");
        let lbtc = asset("L-BTC");

        let in_usdt = BlindingFactor::random();
        let in_lbtc = BlindingFactor::random();
        let out_usdt = BlindingFactor::random();
        let last = balancing_factor(&[in_usdt, in_lbtc], &[out_usdt]);

        let inputs = [commit(&usdt, 1_000, &in_usdt), commit(&lbtc, 700, &in_lbtc)];
        let outputs = [commit(&usdt, 1_000, &out_usdt), commit(&lbtc, 200, &last)];

        assert!(commitments_balance(&inputs, &outputs, 500, &lbtc));

        // Wrong fee, wrong fee asset, or an inflated output all break the identity
        assert!(!commitments_balance(&inputs, &outputs, 499, &lbtc));
        assert!(!commitments_balance(&inputs, &outputs, 500, &usdt));
        let inflated = [commit(&usdt, 1_001, &out_usdt), commit(&lbtc, 200, &last)];
        assert!(!commitments_balance(&inputs, &inflated, 500, &lbtc));
    }

    #[test]
    fn test_blind_unblind_round_trip() {
        let recipient = BlindingSecretKey::random();
        let blinding = BlindingFactor::random();

        let blinded =
            blind_output(&asset("USDT"), 100_100, &blinding, &recipient.public_key()).unwrap();
        let opening = unblind_output(
            &asset("USDT"),
            &blinded.commitment,
            &blinded.ephemeral_pubkey,
            &blinded.rewind,
            &recipient,
        )
        .unwrap();

        assert_eq!(opening.amount, 100_100);
        assert_eq!(opening.blinding, blinding);
    }

    #[test]
    fn test_unblind_with_wrong_key_fails() {
        let recipient = BlindingSecretKey::random();
        let stranger = BlindingSecretKey::random();

        let blinded = blind_output(
            &asset("USDT"),
            42,
            &BlindingFactor::random(),
            &recipient.public_key(),
        )
        .unwrap();

        let result = unblind_output(
            &asset("USDT"),
            &blinded.commitment,
            &blinded.ephemeral_pubkey,
            &blinded.rewind,
            &stranger,
        );
        assert!(matches!(result, Err(SettlementError::Blinding(_))));
    }

    #[test]
    fn test_hash_to_scalar_deterministic() {
        let a = hash_to_scalar(b"tag", &[b"x"]);
        let b = hash_to_scalar(b"tag", &[b"x"]);
        let c = hash_to_scalar(b"other", &[b"x"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
