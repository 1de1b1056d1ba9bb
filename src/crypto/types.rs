//! Cryptographic types for the confidentiality layer

use crate::types::{serde_hex, AssetId};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Blinding factor `r` of a Pedersen value commitment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlindingFactor(pub Scalar);

impl BlindingFactor {
    /// Fresh uniformly random blinding factor
    pub fn random() -> Self {
        BlindingFactor(Scalar::random(&mut OsRng))
    }

    pub fn zero() -> Self {
        BlindingFactor(Scalar::ZERO)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Parse a canonical scalar encoding
    pub fn from_canonical_bytes(bytes: [u8; 32]) -> Option<Self> {
        Option::from(Scalar::from_canonical_bytes(bytes)).map(BlindingFactor)
    }
}

/// Pedersen commitment `v·H_asset + r·G`, stored compressed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueCommitment(#[serde(with = "serde_hex")] pub [u8; 32]);

impl ValueCommitment {
    pub fn from_point(point: &RistrettoPoint) -> Self {
        ValueCommitment(point.compress().to_bytes())
    }

    pub fn to_point(&self) -> Option<RistrettoPoint> {
        CompressedRistretto(self.0).decompress()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Public half of a blinding keypair, embedded in confidential addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlindingPublicKey(#[serde(with = "serde_hex")] pub [u8; 32]);

impl BlindingPublicKey {
    pub fn to_point(&self) -> Option<RistrettoPoint> {
        CompressedRistretto(self.0).decompress()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Secret half of a blinding keypair; only its holder can unblind outputs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlindingSecretKey(pub Scalar);

impl BlindingSecretKey {
    pub fn random() -> Self {
        BlindingSecretKey(Scalar::random(&mut OsRng))
    }

    pub fn public_key(&self) -> BlindingPublicKey {
        BlindingPublicKey(RistrettoPoint::mul_base(&self.0).compress().to_bytes())
    }
}

/// Encrypted `(amount ‖ blinding factor)` carried in each blinded output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RewindPayload(#[serde(with = "serde_hex")] pub [u8; 40]);

/// Serialized 64-bit range proof over an output's value commitment
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueRangeProof(#[serde(with = "hex")] pub Vec<u8>);

impl ValueRangeProof {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Commitment opening reveals the committed values
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitmentOpening {
    /// Asset the commitment is denominated in
    pub asset: AssetId,
    /// Actual amount committed
    pub amount: u64,
    /// Blinding factor used in the commitment
    pub blinding: BlindingFactor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blinding_factor_bytes() {
        let factor = BlindingFactor::random();
        let parsed = BlindingFactor::from_canonical_bytes(factor.to_bytes()).unwrap();
        assert_eq!(factor, parsed);

        // All-ones is above the group order and not canonical
        assert!(BlindingFactor::from_canonical_bytes([0xff; 32]).is_none());
    }

    #[test]
    fn test_commitment_serialization() {
        let point = RistrettoPoint::mul_base(&Scalar::from(7u64));
        let commitment = ValueCommitment::from_point(&point);

        let serialized = serde_json::to_string(&commitment).unwrap();
        let deserialized: ValueCommitment = serde_json::from_str(&serialized).unwrap();
        assert_eq!(commitment, deserialized);
        assert_eq!(deserialized.to_point().unwrap(), point);
    }

    #[test]
    fn test_blinding_keypair() {
        let secret = BlindingSecretKey::random();
        let public = secret.public_key();
        assert_eq!(
            public.to_point().unwrap(),
            RistrettoPoint::mul_base(&secret.0)
        );
    }
}
