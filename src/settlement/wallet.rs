//! Per-party coin discovery and selection

use crate::crypto::{unblind_output, BlindingSecretKey, CommitmentOpening};
use crate::error::{Result, SettlementError};
use crate::identity::ParticipantKeyset;
use crate::ledger::{GuardedLedger, Utxo};
use crate::types::{AssetId, Role};
use std::collections::BTreeMap;
use tracing::debug;

use super::reservation::UtxoReservations;

/// A UTXO together with its recovered opening
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnedCoin {
    pub utxo: Utxo,
    pub opening: CommitmentOpening,
}

impl OwnedCoin {
    pub fn amount(&self) -> u64 {
        self.opening.amount
    }

    pub fn asset(&self) -> AssetId {
        self.opening.asset
    }
}

/// Open every UTXO in `utxos` that was blinded to `secret`
pub fn unblind_all(utxos: &[Utxo], secret: &BlindingSecretKey) -> Vec<OwnedCoin> {
    utxos
        .iter()
        .filter_map(|utxo| {
            match unblind_output(
                &utxo.asset,
                &utxo.commitment,
                &utxo.ephemeral_pubkey,
                &utxo.rewind,
                secret,
            ) {
                Ok(opening) => Some(OwnedCoin {
                    utxo: *utxo,
                    opening,
                }),
                Err(e) => {
                    debug!(outpoint = %utxo.outpoint, error = %e, "Skipping output we cannot open");
                    None
                }
            }
        })
        .collect()
}

/// Unreserved coins in the participant's wallet
pub async fn spendable_coins(
    ledger: &GuardedLedger,
    keys: &ParticipantKeyset,
    reservations: &UtxoReservations,
) -> Result<Vec<OwnedCoin>> {
    let script = keys.wallet_script();
    let utxos = ledger.list_unspent(&script).await?;
    let coins = unblind_all(&utxos, &keys.blinding_key_for(&script))
        .into_iter()
        .filter(|coin| !reservations.is_reserved(&coin.utxo.outpoint))
        .collect();
    Ok(coins)
}

/// Add `amount` of `asset` to a requirement map
pub fn require(requirements: &mut BTreeMap<AssetId, u64>, asset: AssetId, amount: u64) -> Result<()> {
    if amount > 0 {
        let entry = requirements.entry(asset).or_insert(0);
        *entry = entry
            .checked_add(amount)
            .ok_or(SettlementError::AmountOverflow(asset))?;
    }
    Ok(())
}

/// Largest-first selection covering every requirement
pub fn select_coins(
    coins: &[OwnedCoin],
    requirements: &BTreeMap<AssetId, u64>,
    party: Role,
) -> Result<Vec<OwnedCoin>> {
    let mut selected = Vec::new();
    for (asset, &required) in requirements {
        let mut candidates: Vec<&OwnedCoin> = coins.iter().filter(|c| c.asset() == *asset).collect();
        candidates.sort_by(|a, b| b.amount().cmp(&a.amount()).then(a.utxo.outpoint.cmp(&b.utxo.outpoint)));

        let mut total = 0u64;
        for coin in candidates {
            if total >= required {
                break;
            }
            total = total.saturating_add(coin.amount());
            selected.push(*coin);
        }

        if total < required {
            return Err(SettlementError::InsufficientFunds {
                party,
                asset: *asset,
                required,
                available: total,
            });
        }
    }
    Ok(selected)
}

/// Per-asset totals of `coins`
pub fn totals(coins: &[OwnedCoin]) -> Result<BTreeMap<AssetId, u64>> {
    let mut totals = BTreeMap::new();
    for coin in coins {
        require(&mut totals, coin.asset(), coin.amount())?;
    }
    Ok(totals)
}

/// Amount left over per asset after paying `requirements`
pub fn change(coins: &[OwnedCoin], requirements: &BTreeMap<AssetId, u64>) -> Result<BTreeMap<AssetId, u64>> {
    Ok(totals(coins)?
        .into_iter()
        .map(|(asset, total)| (asset, total.saturating_sub(requirements.get(&asset).copied().unwrap_or(0))))
        .filter(|(_, amount)| *amount > 0)
        .collect())
}
