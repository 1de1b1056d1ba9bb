//! Blinded transaction construction
//!
//! Every output gets an independent random blinding factor except the last,
//! whose factor is chosen so that the blinding factors of inputs and outputs
//! cancel. Each output carries a range proof over its commitment, and the
//! commitment identity is checked before anyone signs.

use crate::crypto::{
    balancing_factor, blind_output, commitments_balance, prove_range, verify_opening,
    BlindingFactor,
};
use crate::descriptor::ConfidentialAddress;
use crate::error::{Result, SettlementError};
use crate::types::{AssetId, Hash};
use std::collections::BTreeMap;
use tracing::debug;

use super::types::{BlindedOutput, InputPlan, SettlementTransaction, TxInput};
use super::wallet::OwnedCoin;

/// Input to spend, with its opening and how it will be satisfied
#[derive(Clone, Debug)]
pub struct InputSpec {
    pub coin: OwnedCoin,
    pub plan: InputPlan,
    pub sequence: u32,
}

/// Output to create
#[derive(Clone, Copy, Debug)]
pub struct OutputSpec {
    pub address: ConfidentialAddress,
    pub asset: AssetId,
    pub amount: u64,
}

/// Build an unsigned, balanced, blinded transaction
pub fn build_blinded_transaction(
    inputs: &[InputSpec],
    outputs: &[OutputSpec],
    fee: u64,
    fee_asset: AssetId,
    descriptor_ref: Option<Hash>,
) -> Result<SettlementTransaction> {
    if outputs.is_empty() {
        return Err(SettlementError::Blinding("no outputs to blind".to_string()));
    }

    for input in inputs {
        if !verify_opening(&input.coin.utxo.commitment, &input.coin.opening) {
            return Err(SettlementError::Blinding(format!(
                "opening does not match commitment of {}",
                input.coin.utxo.outpoint
            )));
        }
    }
    check_amounts(inputs, outputs, fee, &fee_asset)?;

    let input_factors: Vec<BlindingFactor> = inputs.iter().map(|s| s.coin.opening.blinding).collect();
    let mut output_factors: Vec<BlindingFactor> = (1..outputs.len()).map(|_| BlindingFactor::random()).collect();
    output_factors.push(balancing_factor(&input_factors, &output_factors));

    let mut blinded = Vec::with_capacity(outputs.len());
    for (output, factor) in outputs.iter().zip(&output_factors) {
        let value = blind_output(&output.asset, output.amount, factor, &output.address.blinding_pubkey)?;
        blinded.push(BlindedOutput {
            script: output.address.script,
            asset: output.asset,
            commitment: value.commitment,
            ephemeral_pubkey: value.ephemeral_pubkey,
            rewind: value.rewind,
            range_proof: prove_range(&output.asset, output.amount, factor)?,
        });
    }

    let input_commitments: Vec<_> = inputs.iter().map(|s| s.coin.utxo.commitment).collect();
    let output_commitments: Vec<_> = blinded.iter().map(|o| o.commitment).collect();
    if !commitments_balance(&input_commitments, &output_commitments, fee, &fee_asset) {
        return Err(SettlementError::Blinding(
            "commitments do not balance".to_string(),
        ));
    }

    let tx = SettlementTransaction::new(
        inputs
            .iter()
            .map(|s| TxInput {
                outpoint: s.coin.utxo.outpoint,
                sequence: s.sequence,
            })
            .collect(),
        inputs.iter().map(|s| s.plan.clone()).collect(),
        blinded,
        fee,
        fee_asset,
        descriptor_ref,
    )?;

    debug!(
        txid = %tx.txid(),
        inputs = tx.inputs.len(),
        outputs = tx.outputs.len(),
        fee,
        "Constructed blinded transaction"
    );
    Ok(tx)
}

/// Cleartext conservation per asset, checked before blinding
fn check_amounts(inputs: &[InputSpec], outputs: &[OutputSpec], fee: u64, fee_asset: &AssetId) -> Result<()> {
    let mut balance: BTreeMap<AssetId, i128> = BTreeMap::new();
    for input in inputs {
        *balance.entry(input.coin.asset()).or_insert(0) += input.coin.amount() as i128;
    }
    for output in outputs {
        *balance.entry(output.asset).or_insert(0) -= output.amount as i128;
    }
    *balance.entry(*fee_asset).or_insert(0) -= fee as i128;

    match balance.iter().find(|(_, delta)| **delta != 0) {
        Some((asset, delta)) => Err(SettlementError::Blinding(format!(
            "asset {} unbalanced by {}",
            asset, delta
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{unblind_output, verify_range};
    use crate::identity::ParticipantKeyset;
    use crate::ledger::Utxo;
    use crate::settlement::types::SEQUENCE_FINAL;
    use crate::settlement::wallet::unblind_all;
    use crate::types::{OutPoint, ParticipantId, Txid};

    fn owned(keys: &ParticipantKeyset, asset: AssetId, amount: u64, n: u32) -> OwnedCoin {
        let address = keys.wallet_address();
        let blinded = blind_output(&asset, amount, &BlindingFactor::random(), &address.blinding_pubkey).unwrap();
        let utxo = Utxo {
            outpoint: OutPoint::new(Txid(Hash::from_bytes(b"prev")), n),
            script: address.script,
            asset,
            commitment: blinded.commitment,
            ephemeral_pubkey: blinded.ephemeral_pubkey,
            rewind: blinded.rewind,
            height: Some(1),
        };
        unblind_all(&[utxo], &keys.blinding_key_for(&address.script))[0]
    }

    fn key_input(keys: &ParticipantKeyset, coin: OwnedCoin) -> InputSpec {
        InputSpec {
            coin,
            plan: InputPlan::Key {
                pubkey: keys.payment_pubkey(),
            },
            sequence: SEQUENCE_FINAL,
        }
    }

    #[test]
    fn test_two_asset_swap_balances() {
        let client = ParticipantKeyset::from_seed(ParticipantId::new("client"), b"b");
        let dealer = ParticipantKeyset::from_seed(ParticipantId::new("dealer"), b"b");
        let usdt = AssetId::from_label("USDT");
        let lbtc = AssetId::from_label("L-BTC");

        let inputs = vec![
            key_input(&client, owned(&client, usdt, 100_100, 0)),
            key_input(&dealer, owned(&dealer, lbtc, 1_500, 1)),
        ];
        let outputs = vec![
            OutputSpec {
                address: dealer.wallet_address(),
                asset: usdt,
                amount: 100_100,
            },
            OutputSpec {
                address: client.wallet_address(),
                asset: lbtc,
                amount: 1_000,
            },
            OutputSpec {
                address: dealer.wallet_address(),
                asset: lbtc,
                amount: 450,
            },
        ];

        let tx = build_blinded_transaction(&inputs, &outputs, 50, lbtc, None).unwrap();
        let in_commitments: Vec<_> = inputs.iter().map(|s| s.coin.utxo.commitment).collect();
        assert!(commitments_balance(&in_commitments, &tx.commitments(), 50, &lbtc));
        for out in &tx.outputs {
            assert!(verify_range(&out.asset, &out.commitment, &out.range_proof));
        }

        // Proofs are witness data
        let mut stripped = tx.clone();
        stripped.outputs[0].range_proof = Default::default();
        assert_eq!(stripped.txid(), tx.txid());

        // Recipient recovers its cleartext amount
        let out = &tx.outputs[1];
        let opening = unblind_output(
            &out.asset,
            &out.commitment,
            &out.ephemeral_pubkey,
            &out.rewind,
            &client.blinding_key_for(&out.script),
        )
        .unwrap();
        assert_eq!(opening.amount, 1_000);

        // The dealer cannot open the client's output
        assert!(unblind_output(
            &out.asset,
            &out.commitment,
            &out.ephemeral_pubkey,
            &out.rewind,
            &dealer.blinding_key_for(&out.script),
        )
        .is_err());
    }

    #[test]
    fn test_unbalanced_amounts_rejected() {
        let client = ParticipantKeyset::from_seed(ParticipantId::new("client"), b"b");
        let usdt = AssetId::from_label("USDT");
        let inputs = vec![key_input(&client, owned(&client, usdt, 100, 0))];
        let outputs = vec![OutputSpec {
            address: client.wallet_address(),
            asset: usdt,
            amount: 101,
        }];

        assert!(matches!(
            build_blinded_transaction(&inputs, &outputs, 0, usdt, None),
            Err(SettlementError::Blinding(_))
        ));
    }

    #[test]
    fn test_forged_opening_rejected() {
        let client = ParticipantKeyset::from_seed(ParticipantId::new("client"), b"b");
        let usdt = AssetId::from_label("USDT");
        let mut coin = owned(&client, usdt, 100, 0);
        coin.opening.amount = 1_000;

        let outputs = vec![OutputSpec {
            address: client.wallet_address(),
            asset: usdt,
            amount: 1_000,
        }];
        assert!(matches!(
            build_blinded_transaction(&[key_input(&client, coin)], &outputs, 0, usdt, None),
            Err(SettlementError::Blinding(_))
        ));
    }
}
