//! Spending policy scripts
//!
//! The joint policy `or(and(pk(C),pk(D)), and(pk(C),older(n)))` compiles to
//!
//! ```text
//! OP_IF <D> OP_CHECKSIGVERIFY OP_ELSE <n> OP_CSV OP_DROP OP_ENDIF <C> OP_CHECKSIG
//! ```
//!
//! The client key is required on both paths; the dealer key only on the
//! co-sign path, and the relative timelock only on the reclaim path.

use crate::crypto::PaymentPublicKey;
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

const OP_IF: u8 = 0x63;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_DROP: u8 = 0x75;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
const OP_PUSHBYTES_3: u8 = 0x03;
const OP_PUSHBYTES_32: u8 = 0x20;

const JOINT_SCRIPT_LEN: usize = 77;

/// Largest relative timelock expressible in the block-based sequence encoding
pub const MAX_CSV_DELAY: u32 = 0xffff;

/// Which branch of the joint policy a spend satisfies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendBranch {
    /// Client and dealer co-sign, valid at any time
    Cosign,
    /// Client alone, valid once the output has `csv_delay` confirmations
    Reclaim,
}

/// Decoded joint policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JointPolicy {
    pub client: PaymentPublicKey,
    pub dealer: PaymentPublicKey,
    pub csv_delay: u32,
}

impl JointPolicy {
    /// Human-readable policy expression
    pub fn expression(&self) -> String {
        format!(
            "or(and(pk({c}),pk({d})),and(pk({c}),older({n})))",
            c = self.client,
            d = self.dealer,
            n = self.csv_delay
        )
    }
}

/// Compiled policy script bytes; only well-formed joint scripts are representable
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PolicyScript {
    bytes: Vec<u8>,
    policy: JointPolicy,
}

impl PolicyScript {
    /// Compile the joint co-sign / timelocked-reclaim policy
    pub fn compile(policy: &JointPolicy) -> Self {
        let mut script = Vec::with_capacity(JOINT_SCRIPT_LEN);
        script.push(OP_IF);
        script.push(OP_PUSHBYTES_32);
        script.extend_from_slice(&policy.dealer.0);
        script.push(OP_CHECKSIGVERIFY);
        script.push(OP_ELSE);
        script.push(OP_PUSHBYTES_3);
        script.extend_from_slice(&policy.csv_delay.to_le_bytes()[..3]);
        script.push(OP_CHECKSEQUENCEVERIFY);
        script.push(OP_DROP);
        script.push(OP_ENDIF);
        script.push(OP_PUSHBYTES_32);
        script.extend_from_slice(&policy.client.0);
        script.push(OP_CHECKSIG);
        PolicyScript {
            bytes: script,
            policy: *policy,
        }
    }

    /// Decode the script back into its policy
    pub fn parse(bytes: &[u8]) -> Option<JointPolicy> {
        if bytes.len() != JOINT_SCRIPT_LEN {
            return None;
        }

        let expect = |at: usize, op: u8| bytes[at] == op;
        let fixed_ok = expect(0, OP_IF)
            && expect(1, OP_PUSHBYTES_32)
            && expect(34, OP_CHECKSIGVERIFY)
            && expect(35, OP_ELSE)
            && expect(36, OP_PUSHBYTES_3)
            && expect(40, OP_CHECKSEQUENCEVERIFY)
            && expect(41, OP_DROP)
            && expect(42, OP_ENDIF)
            && expect(43, OP_PUSHBYTES_32)
            && expect(76, OP_CHECKSIG);
        if !fixed_ok {
            return None;
        }

        let mut dealer = [0u8; 32];
        dealer.copy_from_slice(&bytes[2..34]);
        let mut client = [0u8; 32];
        client.copy_from_slice(&bytes[44..76]);
        let csv_delay = u32::from_le_bytes([bytes[37], bytes[38], bytes[39], 0]);

        Some(JointPolicy {
            client: PaymentPublicKey(client),
            dealer: PaymentPublicKey(dealer),
            csv_delay,
        })
    }

    pub fn policy(&self) -> JointPolicy {
        self.policy
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Commitment to the script used by pay-to-policy outputs
    pub fn script_hash(&self) -> Hash {
        Hash::tagged(b"crfq/policy-script/v1", &[&self.bytes])
    }
}

impl fmt::Debug for PolicyScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolicyScript({})", self.to_hex())
    }
}

impl TryFrom<String> for PolicyScript {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| e.to_string())?;
        let policy = Self::parse(&bytes).ok_or_else(|| "not a joint policy script".to_string())?;
        Ok(PolicyScript { bytes, policy })
    }
}

impl From<PolicyScript> for String {
    fn from(script: PolicyScript) -> Self {
        script.to_hex()
    }
}

/// Locking condition of a transaction output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "program", rename_all = "snake_case")]
pub enum LockingScript {
    /// Spendable by a signature from a single payment key
    PayToKey(PaymentPublicKey),
    /// Spendable by revealing and satisfying the policy script with this hash
    PayToPolicy(Hash),
}

impl LockingScript {
    pub fn version(&self) -> u8 {
        match self {
            LockingScript::PayToKey(_) => 0,
            LockingScript::PayToPolicy(_) => 1,
        }
    }

    pub fn program(&self) -> [u8; 32] {
        match self {
            LockingScript::PayToKey(key) => key.0,
            LockingScript::PayToPolicy(hash) => hash.0,
        }
    }

    /// Serialized form used in sighashes and address encoding
    pub fn to_bytes(&self) -> [u8; 33] {
        let mut bytes = [0u8; 33];
        bytes[0] = self.version();
        bytes[1..].copy_from_slice(&self.program());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 33 {
            return None;
        }
        let mut program = [0u8; 32];
        program.copy_from_slice(&bytes[1..]);
        match bytes[0] {
            0 => Some(LockingScript::PayToKey(PaymentPublicKey(program))),
            1 => Some(LockingScript::PayToPolicy(Hash(program))),
            _ => None,
        }
    }
}
