//! Joint descriptor construction

use crate::crypto::{hash_to_scalar, BlindingPublicKey, BlindingSecretKey, PaymentPublicKey};
use crate::error::AddressConstructionError;
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::policy::{JointPolicy, LockingScript, PolicyScript, MAX_CSV_DELAY};

const ADDRESS_PREFIX: &str = "ct1";

/// Confidential address: a locking script plus the blinding key senders
/// use so that only the recipient can open the value commitment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfidentialAddress {
    pub script: LockingScript,
    pub blinding_pubkey: BlindingPublicKey,
}

impl ConfidentialAddress {
    pub fn new(script: LockingScript, blinding_pubkey: BlindingPublicKey) -> Self {
        Self {
            script,
            blinding_pubkey,
        }
    }

    /// Unconfidential form, as observers see it on the ledger
    pub fn unconfidential(&self) -> String {
        format!("{}{}", ADDRESS_PREFIX, hex::encode(self.script.to_bytes()))
    }
}

impl fmt::Display for ConfidentialAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            ADDRESS_PREFIX,
            hex::encode(self.script.to_bytes()),
            self.blinding_pubkey.to_hex()
        )
    }
}

impl FromStr for ConfidentialAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let payload = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or_else(|| format!("missing {} prefix", ADDRESS_PREFIX))?;
        let bytes = hex::decode(payload).map_err(|e| e.to_string())?;
        if bytes.len() != 65 {
            return Err(format!("expected 65 payload bytes, got {}", bytes.len()));
        }

        let script = LockingScript::from_bytes(&bytes[..33])
            .ok_or_else(|| "unknown script version".to_string())?;
        let mut blinding = [0u8; 32];
        blinding.copy_from_slice(&bytes[33..]);
        let blinding_pubkey = BlindingPublicKey(blinding);
        if blinding_pubkey.to_point().is_none() {
            return Err("invalid blinding key".to_string());
        }

        Ok(ConfidentialAddress::new(script, blinding_pubkey))
    }
}

impl TryFrom<String> for ConfidentialAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConfidentialAddress> for String {
    fn from(address: ConfidentialAddress) -> Self {
        address.to_string()
    }
}

/// Two-branch spending policy shared by client and dealer
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "JointDescriptorWire")]
pub struct JointDescriptor {
    client_payment_pubkey: PaymentPublicKey,
    dealer_payment_pubkey: PaymentPublicKey,
    csv_delay: u32,
    policy_script: PolicyScript,
}

#[derive(Deserialize)]
struct JointDescriptorWire {
    client_payment_pubkey: PaymentPublicKey,
    dealer_payment_pubkey: PaymentPublicKey,
    csv_delay: u32,
    policy_script: PolicyScript,
}

impl TryFrom<JointDescriptorWire> for JointDescriptor {
    type Error = AddressConstructionError;

    fn try_from(wire: JointDescriptorWire) -> Result<Self, Self::Error> {
        let (_, descriptor) = build_joint_timelocked_address(
            wire.client_payment_pubkey,
            wire.dealer_payment_pubkey,
            wire.csv_delay,
        )?;
        if descriptor.policy_script != wire.policy_script {
            return Err(AddressConstructionError::InvalidKey(
                "policy script does not match descriptor keys".to_string(),
            ));
        }
        Ok(descriptor)
    }
}

impl JointDescriptor {
    pub fn client_payment_pubkey(&self) -> PaymentPublicKey {
        self.client_payment_pubkey
    }

    pub fn dealer_payment_pubkey(&self) -> PaymentPublicKey {
        self.dealer_payment_pubkey
    }

    pub fn csv_delay(&self) -> u32 {
        self.csv_delay
    }

    pub fn policy_script(&self) -> &PolicyScript {
        &self.policy_script
    }

    pub fn policy(&self) -> JointPolicy {
        self.policy_script.policy()
    }

    pub fn locking_script(&self) -> LockingScript {
        LockingScript::PayToPolicy(self.policy_script.script_hash())
    }

    /// Stable reference used by settlement transactions and the ledger watch list
    pub fn descriptor_ref(&self) -> Hash {
        self.policy_script.script_hash()
    }

    /// Blinding secret both counterparties can derive from the descriptor alone
    pub fn blinding_secret(&self) -> BlindingSecretKey {
        BlindingSecretKey(hash_to_scalar(
            b"crfq/joint-blinding/v1",
            &[self.policy_script.as_bytes()],
        ))
    }

    pub fn address(&self) -> ConfidentialAddress {
        ConfidentialAddress::new(self.locking_script(), self.blinding_secret().public_key())
    }

    /// Serialized, re-derivable descriptor string
    pub fn to_descriptor_string(&self) -> String {
        format!(
            "ct({},wsh({}))",
            self.blinding_secret().public_key().to_hex(),
            self.policy().expression()
        )
    }
}

impl fmt::Display for JointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_descriptor_string())
    }
}

/// Derive the joint co-sign / timelocked-reclaim descriptor and its address
pub fn build_joint_timelocked_address(
    client_pub: PaymentPublicKey,
    dealer_pub: PaymentPublicKey,
    csv_delay: u32,
) -> Result<(ConfidentialAddress, JointDescriptor), AddressConstructionError> {
    if client_pub == dealer_pub {
        return Err(AddressConstructionError::DuplicateKey);
    }
    if csv_delay == 0 || csv_delay > MAX_CSV_DELAY {
        return Err(AddressConstructionError::InvalidDelay(csv_delay));
    }
    for key in [&client_pub, &dealer_pub] {
        if !key.is_valid() {
            return Err(AddressConstructionError::InvalidKey(key.to_hex()));
        }
    }

    let policy_script = PolicyScript::compile(&JointPolicy {
        client: client_pub,
        dealer: dealer_pub,
        csv_delay,
    });

    let descriptor = JointDescriptor {
        client_payment_pubkey: client_pub,
        dealer_payment_pubkey: dealer_pub,
        csv_delay,
        policy_script,
    };

    Ok((descriptor.address(), descriptor))
}
