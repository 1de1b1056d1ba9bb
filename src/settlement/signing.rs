//! Partial signing, finalization and witness verification

use crate::crypto::{PaymentPublicKey, PaymentSecretKey, SchnorrSignature};
use crate::descriptor::{LockingScript, SpendBranch};
use crate::error::{Result, SettlementError};
use tracing::debug;

use super::types::{
    relative_lock_blocks, InputPlan, PartialSignature, SettlementStatus, SettlementTransaction,
    Witness,
};

/// Sign every input whose plan needs `key`; returns the signed input indices.
///
/// Signing twice with the same key replaces the earlier signature, so the
/// order in which parties sign does not matter.
pub fn sign_transaction(tx: &mut SettlementTransaction, key: &PaymentSecretKey) -> Result<Vec<usize>> {
    if !matches!(
        tx.status(),
        SettlementStatus::Draft | SettlementStatus::PartiallySigned
    ) {
        return Err(SettlementError::InvalidStateTransition(format!(
            "cannot sign a {} transaction",
            tx.status()
        )));
    }

    let pubkey = key.public_key();
    let controlled: Vec<usize> = tx
        .input_plans
        .iter()
        .enumerate()
        .filter(|(_, plan)| plan.required_signers().contains(&pubkey))
        .map(|(index, _)| index)
        .collect();

    for &index in &controlled {
        let signature = key.sign(&tx.sighash(index).0);
        let entry = tx.signatures_by_input.entry(index).or_default();
        entry.retain(|s| s.pubkey != pubkey);
        entry.push(PartialSignature { pubkey, signature });
    }

    if !controlled.is_empty() {
        tx.set_status(SettlementStatus::PartiallySigned)?;
    }
    debug!(txid = %tx.txid(), signer = ?pubkey, inputs = ?controlled, "Signed inputs");
    Ok(controlled)
}

/// Assemble witnesses once every input's spending condition is satisfied
pub fn finalize_transaction(tx: &mut SettlementTransaction) -> Result<()> {
    if tx.status() != SettlementStatus::PartiallySigned {
        return Err(SettlementError::InvalidStateTransition(format!(
            "cannot finalize a {} transaction",
            tx.status()
        )));
    }

    let mut witnesses = Vec::with_capacity(tx.inputs.len());
    for (index, plan) in tx.input_plans.iter().enumerate() {
        let sighash = tx.sighash(index);
        let signatures = tx.signatures_by_input.get(&index).map(Vec::as_slice).unwrap_or(&[]);

        let signature_of = |pubkey: PaymentPublicKey| -> Result<SchnorrSignature> {
            let partial = signatures
                .iter()
                .find(|s| s.pubkey == pubkey)
                .ok_or_else(|| SettlementError::Signature {
                    input: index,
                    reason: format!("missing signature from {:?}", pubkey),
                })?;
            if !pubkey.verify(&sighash.0, &partial.signature) {
                return Err(SettlementError::Signature {
                    input: index,
                    reason: format!("invalid signature from {:?}", pubkey),
                });
            }
            Ok(partial.signature)
        };

        let witness = match plan {
            InputPlan::Key { pubkey } => Witness::Key {
                signature: signature_of(*pubkey)?,
            },
            InputPlan::Policy { script, branch } => {
                let policy = script.policy();
                let dealer_signature = match branch {
                    SpendBranch::Cosign => Some(signature_of(policy.dealer)?),
                    SpendBranch::Reclaim => None,
                };
                Witness::Policy {
                    script: script.clone(),
                    branch: *branch,
                    client_signature: signature_of(policy.client)?,
                    dealer_signature,
                }
            }
        };
        witnesses.push(witness);
    }

    tx.witnesses = witnesses;
    tx.set_status(SettlementStatus::Finalized)
}

/// Check that input `index` of `tx` satisfies `prevout_script`.
///
/// Errors carry a script-verification reason string.
pub fn verify_input_witness(
    tx: &SettlementTransaction,
    index: usize,
    prevout_script: &LockingScript,
) -> std::result::Result<(), String> {
    let witness = tx
        .witnesses
        .get(index)
        .ok_or_else(|| "Witness program was passed an empty witness".to_string())?;
    let input = tx
        .inputs
        .get(index)
        .ok_or_else(|| "input index out of range".to_string())?;
    let sighash = tx.sighash(index);

    match (prevout_script, witness) {
        (LockingScript::PayToKey(pubkey), Witness::Key { signature }) => {
            if pubkey.verify(&sighash.0, signature) {
                Ok(())
            } else {
                Err("Signature must be zero for failed CHECK(MULTI)SIG operation".to_string())
            }
        }
        (
            LockingScript::PayToPolicy(program),
            Witness::Policy {
                script,
                branch,
                client_signature,
                dealer_signature,
            },
        ) => {
            if script.script_hash() != *program {
                return Err("Witness program hash mismatch".to_string());
            }
            let policy = script.policy();

            match branch {
                SpendBranch::Cosign => {
                    let dealer_signature = dealer_signature
                        .as_ref()
                        .ok_or_else(|| "Operation not valid with the current stack size".to_string())?;
                    if !policy.dealer.verify(&sighash.0, dealer_signature) {
                        return Err("Script failed an OP_CHECKSIGVERIFY operation".to_string());
                    }
                }
                SpendBranch::Reclaim => match relative_lock_blocks(input.sequence) {
                    Some(blocks) if blocks >= policy.csv_delay => {}
                    _ => return Err("Locktime requirement not satisfied".to_string()),
                },
            }

            if policy.client.verify(&sighash.0, client_signature) {
                Ok(())
            } else {
                Err("Signature must be zero for failed CHECK(MULTI)SIG operation".to_string())
            }
        }
        _ => Err("Witness version mismatch".to_string()),
    }
}
