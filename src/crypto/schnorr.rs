//! Schnorr signatures for payment keys
//!
//! Payment keys live in the same group as the value commitments so the joint
//! spending policy and the confidentiality layer share one curve. Nonces are
//! derived deterministically from the secret and the message.

use crate::types::serde_hex;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::commitment::hash_to_scalar;

const NONCE_TAG: &[u8] = b"crfq/schnorr-nonce/v1";
const CHALLENGE_TAG: &[u8] = b"crfq/schnorr-challenge/v1";

/// Payment public key `P = x·G`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentPublicKey(#[serde(with = "serde_hex")] pub [u8; 32]);

impl PaymentPublicKey {
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        crate::types::decode_hex_array(hex_str).map(PaymentPublicKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether the bytes decode to a valid group element
    pub fn is_valid(&self) -> bool {
        self.to_point().is_some()
    }

    fn to_point(&self) -> Option<RistrettoPoint> {
        CompressedRistretto(self.0).decompress()
    }

    /// Verify a signature over `message`
    pub fn verify(&self, message: &[u8], signature: &SchnorrSignature) -> bool {
        let Some(public) = self.to_point() else {
            return false;
        };
        let Some(nonce_point) = CompressedRistretto(signature.r).decompress() else {
            return false;
        };
        let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(signature.s)) else {
            return false;
        };

        let e = challenge(&signature.r, &self.0, message);
        RistrettoPoint::mul_base(&s) == nonce_point + e * public
    }
}

impl fmt::Debug for PaymentPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentPublicKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PaymentPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Payment secret key `x`
#[derive(Clone)]
pub struct PaymentSecretKey(Scalar);

impl PaymentSecretKey {
    pub fn random() -> Self {
        PaymentSecretKey(Scalar::random(&mut OsRng))
    }

    /// Deterministic key from seed material
    pub fn from_seed(seed: &[u8]) -> Self {
        PaymentSecretKey(hash_to_scalar(b"crfq/payment-key/v1", &[seed]))
    }

    pub fn public_key(&self) -> PaymentPublicKey {
        PaymentPublicKey(RistrettoPoint::mul_base(&self.0).compress().to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> SchnorrSignature {
        let public = self.public_key();
        let k = hash_to_scalar(NONCE_TAG, &[self.0.as_bytes(), &public.0, message]);
        let r = RistrettoPoint::mul_base(&k).compress().to_bytes();
        let e = challenge(&r, &public.0, message);

        SchnorrSignature {
            r,
            s: (k + e * self.0).to_bytes(),
        }
    }
}

impl fmt::Debug for PaymentSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentSecretKey(..)")
    }
}

/// Schnorr signature `(R, s)` with `s·G = R + H(R, P, m)·P`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    #[serde(with = "serde_hex")]
    pub r: [u8; 32],
    #[serde(with = "serde_hex")]
    pub s: [u8; 32],
}

fn challenge(r: &[u8; 32], public: &[u8; 32], message: &[u8]) -> Scalar {
    hash_to_scalar(CHALLENGE_TAG, &[r, public, message])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let secret = PaymentSecretKey::random();
        let public = secret.public_key();

        let sig = secret.sign(b"sighash");
        assert!(public.verify(b"sighash", &sig));
    }

    #[test]
    fn test_verify_rejects_other_message_and_key() {
        let secret = PaymentSecretKey::random();
        let sig = secret.sign(b"sighash");

        assert!(!secret.public_key().verify(b"other", &sig));
        assert!(!PaymentSecretKey::random().public_key().verify(b"sighash", &sig));
    }

    #[test]
    fn test_verify_rejects_tampered_signature() {
        let secret = PaymentSecretKey::random();
        let mut sig = secret.sign(b"sighash");
        sig.s[0] ^= 1;
        assert!(!secret.public_key().verify(b"sighash", &sig));
    }

    #[test]
    fn test_deterministic_keys_and_signatures() {
        let a = PaymentSecretKey::from_seed(b"dealer-alpha");
        let b = PaymentSecretKey::from_seed(b"dealer-alpha");
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"m"), b.sign(b"m"));
    }

    #[test]
    fn test_invalid_public_key_bytes() {
        let bogus = PaymentPublicKey([0xff; 32]);
        assert!(!bogus.is_valid());

        let sig = PaymentSecretKey::random().sign(b"m");
        assert!(!bogus.verify(b"m", &sig));
    }
}
