//! Settlement transaction model

use crate::crypto::{
    BlindingPublicKey, PaymentPublicKey, RewindPayload, SchnorrSignature, ValueCommitment,
    ValueRangeProof,
};
use crate::descriptor::{LockingScript, PolicyScript, SpendBranch};
use crate::error::{Result, SettlementError};
use crate::types::{AssetId, Hash, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sequence value with relative locktime disabled
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// Block-based relative lock encoded in `sequence`, if any
pub fn relative_lock_blocks(sequence: u32) -> Option<u32> {
    if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 || sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
        return None;
    }
    Some(sequence & SEQUENCE_LOCKTIME_MASK)
}

/// Transaction input
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub outpoint: OutPoint,
    pub sequence: u32,
}

/// Confidential output: only the commitment is public, the opening travels
/// encrypted to the recipient's blinding key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedOutput {
    pub script: LockingScript,
    pub asset: AssetId,
    pub commitment: ValueCommitment,
    pub ephemeral_pubkey: BlindingPublicKey,
    pub rewind: RewindPayload,
    /// Witness data, not covered by the txid
    pub range_proof: ValueRangeProof,
}

/// How an input is to be satisfied
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputPlan {
    Key {
        pubkey: PaymentPublicKey,
    },
    Policy {
        script: PolicyScript,
        branch: SpendBranch,
    },
}

impl InputPlan {
    /// Keys whose signatures this input needs
    pub fn required_signers(&self) -> Vec<PaymentPublicKey> {
        match self {
            InputPlan::Key { pubkey } => vec![*pubkey],
            InputPlan::Policy { script, branch } => {
                let policy = script.policy();
                match branch {
                    SpendBranch::Cosign => vec![policy.client, policy.dealer],
                    SpendBranch::Reclaim => vec![policy.client],
                }
            }
        }
    }
}

/// Finalized input witness
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Witness {
    Key {
        signature: SchnorrSignature,
    },
    Policy {
        script: PolicyScript,
        branch: SpendBranch,
        client_signature: SchnorrSignature,
        dealer_signature: Option<SchnorrSignature>,
    },
}

/// One party's signature on one input
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub pubkey: PaymentPublicKey,
    pub signature: SchnorrSignature,
}

/// Lifecycle of a settlement transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementStatus {
    Draft,
    PartiallySigned,
    Finalized,
    Broadcast,
    Confirmed,
    Rejected,
}

impl SettlementStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Confirmed | SettlementStatus::Rejected)
    }

    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Draft, PartiallySigned)
                | (Draft, Finalized)
                | (Draft, Rejected)
                | (PartiallySigned, PartiallySigned)
                | (PartiallySigned, Finalized)
                | (PartiallySigned, Rejected)
                | (Finalized, Broadcast)
                | (Finalized, Confirmed)
                | (Finalized, Rejected)
                | (Broadcast, Confirmed)
                | (Broadcast, Rejected)
        )
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Multi-party confidential transaction under construction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTransaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<BlindedOutput>,
    pub fee: u64,
    pub fee_asset: AssetId,
    /// Joint descriptor this transaction funds or spends
    pub descriptor_ref: Option<Hash>,
    pub input_plans: Vec<InputPlan>,
    pub signatures_by_input: BTreeMap<usize, Vec<PartialSignature>>,
    pub witnesses: Vec<Witness>,
    status: SettlementStatus,
}

impl SettlementTransaction {
    pub fn new(
        inputs: Vec<TxInput>,
        input_plans: Vec<InputPlan>,
        outputs: Vec<BlindedOutput>,
        fee: u64,
        fee_asset: AssetId,
        descriptor_ref: Option<Hash>,
    ) -> Result<Self> {
        if inputs.is_empty() || outputs.is_empty() {
            return Err(SettlementError::Blinding(
                "transaction needs at least one input and one output".to_string(),
            ));
        }
        if inputs.len() != input_plans.len() {
            return Err(SettlementError::Signature {
                input: inputs.len().min(input_plans.len()),
                reason: "every input needs a spending plan".to_string(),
            });
        }

        Ok(Self {
            inputs,
            outputs,
            fee,
            fee_asset,
            descriptor_ref,
            input_plans,
            signatures_by_input: BTreeMap::new(),
            witnesses: Vec::new(),
            status: SettlementStatus::Draft,
        })
    }

    pub fn status(&self) -> SettlementStatus {
        self.status
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn set_status(&mut self, next: SettlementStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SettlementError::InvalidStateTransition(format!(
                "{} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Serialization of everything except signatures and witnesses
    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64 + self.inputs.len() * 40 + self.outputs.len() * 170);
        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            bytes.extend_from_slice(&input.outpoint.txid.0 .0);
            bytes.extend_from_slice(&input.outpoint.vout.to_le_bytes());
            bytes.extend_from_slice(&input.sequence.to_le_bytes());
        }
        bytes.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            bytes.extend_from_slice(&output.script.to_bytes());
            bytes.extend_from_slice(&output.asset.0);
            bytes.extend_from_slice(&output.commitment.0);
            bytes.extend_from_slice(&output.ephemeral_pubkey.0);
            bytes.extend_from_slice(&output.rewind.0);
        }
        bytes.extend_from_slice(&self.fee.to_le_bytes());
        bytes.extend_from_slice(&self.fee_asset.0);
        bytes
    }

    /// Transaction id; witnesses are excluded so signing never changes it
    pub fn txid(&self) -> Txid {
        Txid(Hash::tagged(b"crfq/txid/v1", &[&self.unsigned_bytes()]))
    }

    /// Digest signed for `input_index`: commits to every input, output,
    /// commitment and the fee
    pub fn sighash(&self, input_index: usize) -> Hash {
        Hash::tagged(
            b"crfq/sighash/v1",
            &[
                &self.txid().0 .0,
                &(input_index as u32).to_le_bytes(),
            ],
        )
    }

    pub fn commitments(&self) -> Vec<ValueCommitment> {
        self.outputs.iter().map(|o| o.commitment).collect()
    }

    pub fn is_finalized(&self) -> bool {
        self.witnesses.len() == self.inputs.len()
    }
}
