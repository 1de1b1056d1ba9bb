//! Detached message authentication against registered identities

use crate::error::Result;
use crate::types::ParticipantId;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use super::keys::{IdentityKeypair, IdentityPublicKey, IdentitySignature};

/// Known participants and their identity keys
///
/// How keys get here is a trust decision made outside the protocol.
#[derive(Clone, Debug, Default)]
pub struct IdentityRegistry {
    keys: HashMap<ParticipantId, IdentityPublicKey>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or rotate) the identity key of a participant
    pub fn register(&mut self, participant: ParticipantId, key: IdentityPublicKey) {
        debug!(participant = %participant, key = ?key, "Registered identity");
        self.keys.insert(participant, key);
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&IdentityPublicKey> {
        self.keys.get(participant)
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.keys.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Canonical signed bytes: domain prefix, newline, compact JSON in field order
pub fn canonical_payload<T: Serialize>(domain: &str, value: &T) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(domain.len() + 256);
    payload.extend_from_slice(domain.as_bytes());
    payload.push(b'\n');
    serde_json::to_writer(&mut payload, value)?;
    Ok(payload)
}

pub fn sign(payload: &[u8], identity_key: &IdentityKeypair) -> IdentitySignature {
    identity_key.sign(payload)
}

/// Verify `signature` against the key registered for `claimed_identity`;
/// unknown participants never verify
pub fn verify(
    payload: &[u8],
    signature: &IdentitySignature,
    claimed_identity: &ParticipantId,
    registry: &IdentityRegistry,
) -> bool {
    match registry.get(claimed_identity) {
        Some(key) => key.verify(payload, signature),
        None => {
            debug!(participant = %claimed_identity, "No registered identity");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Payload {
        b: u32,
        a: &'static str,
    }

    #[test]
    fn test_canonical_payload_keeps_field_order() {
        let bytes = canonical_payload("crfq/test/v1", &Payload { b: 1, a: "x" }).unwrap();
        assert_eq!(bytes, b"crfq/test/v1\n{\"b\":1,\"a\":\"x\"}".to_vec());
    }

    #[test]
    fn test_verify_against_registry() {
        let alice = IdentityKeypair::random();
        let mallory = IdentityKeypair::random();

        let mut registry = IdentityRegistry::new();
        registry.register(ParticipantId::new("alice"), alice.public_key());

        let payload = b"crfq/test/v1\n{}";
        let sig = sign(payload, &alice);
        assert!(verify(payload, &sig, &ParticipantId::new("alice"), &registry));

        // Valid signature, wrong claimed identity
        let forged = sign(payload, &mallory);
        assert!(!verify(payload, &forged, &ParticipantId::new("alice"), &registry));

        // Unregistered participant
        assert!(!verify(payload, &sig, &ParticipantId::new("bob"), &registry));
    }

    #[test]
    fn test_registry_rotation() {
        let old = IdentityKeypair::random();
        let new = IdentityKeypair::random();
        let id = ParticipantId::new("desk");

        let mut registry = IdentityRegistry::new();
        registry.register(id.clone(), old.public_key());
        registry.register(id.clone(), new.public_key());
        assert_eq!(registry.len(), 1);

        let payload = b"quote";
        assert!(!verify(payload, &old.sign(payload), &id, &registry));
        assert!(verify(payload, &new.sign(payload), &id, &registry));
    }
}
