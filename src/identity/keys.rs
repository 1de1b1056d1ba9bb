//! Participant key material
//!
//! Each participant holds three independent secrets: an ed25519 identity key
//! for authenticating protocol messages, a payment key used inside spending
//! policies and for input signatures, and a blinding master key from which
//! per-script blinding keys are derived.

use crate::crypto::{hash_to_scalar, BlindingSecretKey, PaymentPublicKey, PaymentSecretKey};
use crate::descriptor::{ConfidentialAddress, LockingScript};
use crate::types::{serde_hex, Hash, ParticipantId};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Long-lived identity public key registered for a participant
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityPublicKey(#[serde(with = "serde_hex")] pub [u8; 32]);

impl IdentityPublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check a detached signature over `message`
    pub fn verify(&self, message: &[u8], signature: &IdentitySignature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let signature = Signature::from_bytes(&signature.0);
        key.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey({})", &self.to_hex()[..16])
    }
}

/// Detached ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignature(#[serde(with = "serde_hex")] pub [u8; 64]);

impl fmt::Debug for IdentitySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentitySignature({}..)", hex::encode(&self.0[..8]))
    }
}

/// Identity signing keypair
#[derive(Clone)]
pub struct IdentityKeypair {
    signing: SigningKey,
}

impl IdentityKeypair {
    pub fn random() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8]) -> Self {
        let secret = Hash::tagged(b"crfq/identity-key/v1", &[seed]);
        Self {
            signing: SigningKey::from_bytes(&secret.0),
        }
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> IdentitySignature {
        IdentitySignature(self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &self.public_key())
            .finish()
    }
}

/// Complete key material of one participant
#[derive(Clone)]
pub struct ParticipantKeyset {
    participant_id: ParticipantId,
    identity: IdentityKeypair,
    payment: PaymentSecretKey,
    blinding_master: [u8; 32],
}

impl ParticipantKeyset {
    /// Fresh random keyset
    pub fn generate(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            identity: IdentityKeypair::random(),
            payment: PaymentSecretKey::random(),
            blinding_master: BlindingSecretKey::random().0.to_bytes(),
        }
    }

    /// Deterministic keyset; each key is derived under its own tag so that
    /// knowing one reveals nothing about the others
    pub fn from_seed(participant_id: ParticipantId, seed: &[u8]) -> Self {
        let id = participant_id.0.as_bytes();
        Self {
            identity: IdentityKeypair::from_seed(&[seed, id].concat()),
            payment: PaymentSecretKey::from_seed(&[seed, id].concat()),
            blinding_master: Hash::tagged(b"crfq/blinding-master/v1", &[seed, id]).0,
            participant_id,
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn identity(&self) -> &IdentityKeypair {
        &self.identity
    }

    pub fn identity_pubkey(&self) -> IdentityPublicKey {
        self.identity.public_key()
    }

    pub fn payment(&self) -> &PaymentSecretKey {
        &self.payment
    }

    pub fn payment_pubkey(&self) -> PaymentPublicKey {
        self.payment.public_key()
    }

    /// Blinding key for outputs locked to `script`
    pub fn blinding_key_for(&self, script: &LockingScript) -> BlindingSecretKey {
        BlindingSecretKey(hash_to_scalar(
            b"crfq/script-blinding/v1",
            &[&self.blinding_master, &script.to_bytes()],
        ))
    }

    /// Single-key locking script of this participant's wallet
    pub fn wallet_script(&self) -> LockingScript {
        LockingScript::PayToKey(self.payment_pubkey())
    }

    /// Confidential receive address of this participant's wallet
    pub fn wallet_address(&self) -> ConfidentialAddress {
        let script = self.wallet_script();
        ConfidentialAddress::new(script, self.blinding_key_for(&script).public_key())
    }
}

impl fmt::Debug for ParticipantKeyset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantKeyset")
            .field("participant_id", &self.participant_id)
            .field("identity", &self.identity_pubkey())
            .field("payment", &self.payment_pubkey())
            .finish()
    }
}
