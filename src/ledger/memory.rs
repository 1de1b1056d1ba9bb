//! In-memory regtest ledger
//!
//! Validates submitted transactions the way a confidential-transaction node
//! would (inputs, witnesses, relative timelocks, range proofs, commitment
//! balance) and reports rejections with node-style reason strings.

use crate::crypto::{blind_output, commitments_balance, verify_range, BlindingFactor};
use crate::descriptor::{ConfidentialAddress, JointDescriptor, LockingScript};
use crate::error::{LedgerError, Result};
use crate::settlement::signing::verify_input_witness;
use crate::settlement::types::relative_lock_blocks;
use crate::settlement::SettlementTransaction;
use crate::types::{AssetId, Hash, OutPoint, Txid};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{LedgerEngine, TxStatus, Utxo};

#[derive(Debug, Default)]
struct LedgerState {
    height: u32,
    utxos: HashMap<OutPoint, Utxo>,
    /// Confirmation height per known transaction; `None` while in the mempool
    transactions: HashMap<Txid, Option<u32>>,
    watched: HashSet<Hash>,
    faucet_nonce: u64,
}

impl LedgerState {
    fn mine_block(&mut self) -> u32 {
        self.height += 1;
        let height = self.height;
        for confirmed in self.transactions.values_mut().filter(|h| h.is_none()) {
            *confirmed = Some(height);
        }
        for utxo in self.utxos.values_mut().filter(|u| u.height.is_none()) {
            utxo.height = Some(height);
        }
        height
    }

    fn validate(&self, tx: &SettlementTransaction) -> std::result::Result<Vec<Utxo>, String> {
        if tx.inputs.is_empty() {
            return Err("bad-txns-vin-empty".to_string());
        }
        if tx.outputs.is_empty() {
            return Err("bad-txns-vout-empty".to_string());
        }

        let mut seen = HashSet::new();
        if !tx.inputs.iter().all(|input| seen.insert(input.outpoint)) {
            return Err("bad-txns-inputs-duplicate".to_string());
        }

        let prevouts = tx
            .inputs
            .iter()
            .map(|input| self.utxos.get(&input.outpoint).copied())
            .collect::<Option<Vec<Utxo>>>()
            .ok_or_else(|| "bad-txns-inputs-missingorspent".to_string())?;

        for (index, prevout) in prevouts.iter().enumerate() {
            verify_input_witness(tx, index, &prevout.script).map_err(|reason| {
                format!("mandatory-script-verify-flag-failed ({})", reason)
            })?;
        }

        // Relative locks must be met by the block this transaction would enter
        for (input, prevout) in tx.inputs.iter().zip(&prevouts) {
            if let Some(blocks) = relative_lock_blocks(input.sequence) {
                if prevout.confirmations(self.height) < blocks {
                    return Err("non-BIP68-final".to_string());
                }
            }
        }

        if !tx
            .outputs
            .iter()
            .all(|output| verify_range(&output.asset, &output.commitment, &output.range_proof))
        {
            return Err("bad-txns-output-rangeproof".to_string());
        }

        let inputs: Vec<_> = prevouts.iter().map(|u| u.commitment).collect();
        if !commitments_balance(&inputs, &tx.commitments(), tx.fee, &tx.fee_asset) {
            return Err("bad-txns-in-ne-out".to_string());
        }

        Ok(prevouts)
    }
}

/// Regtest ledger kept entirely in memory
#[derive(Debug)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    mine_on_accept: bool,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    /// Ledger that mines a block for every accepted transaction
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            mine_on_accept: true,
        }
    }

    /// Ledger that leaves accepted transactions in the mempool until
    /// [`generate`](Self::generate) is called
    pub fn manual_mining() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            mine_on_accept: false,
        }
    }

    /// Mine `blocks` blocks; returns the new tip
    pub async fn generate(&self, blocks: u32) -> u32 {
        let mut state = self.state.lock().await;
        for _ in 0..blocks {
            state.mine_block();
        }
        debug!(height = state.height, blocks, "Generated blocks");
        state.height
    }

    /// Pay `amount` of `asset` to `address` in a freshly mined block
    pub async fn fund(&self, address: &ConfidentialAddress, asset: AssetId, amount: u64) -> Result<OutPoint> {
        let blinded = blind_output(&asset, amount, &BlindingFactor::random(), &address.blinding_pubkey)?;

        let mut state = self.state.lock().await;
        state.faucet_nonce += 1;
        let txid = Txid(Hash::tagged(
            b"crfq/faucet/v1",
            &[&state.faucet_nonce.to_le_bytes(), &blinded.commitment.0],
        ));
        let outpoint = OutPoint::new(txid, 0);

        state.transactions.insert(txid, None);
        state.utxos.insert(
            outpoint,
            Utxo {
                outpoint,
                script: address.script,
                asset,
                commitment: blinded.commitment,
                ephemeral_pubkey: blinded.ephemeral_pubkey,
                rewind: blinded.rewind,
                height: None,
            },
        );
        let height = state.mine_block();

        info!(outpoint = %outpoint, asset = %asset, height, "Faucet funded address");
        Ok(outpoint)
    }

    pub async fn is_watched(&self, descriptor: &JointDescriptor) -> bool {
        self.state
            .lock()
            .await
            .watched
            .contains(&descriptor.descriptor_ref())
    }
}

#[async_trait]
impl LedgerEngine for MemoryLedger {
    async fn tip_height(&self) -> std::result::Result<u32, LedgerError> {
        Ok(self.state.lock().await.height)
    }

    async fn list_unspent(&self, script: &LockingScript) -> std::result::Result<Vec<Utxo>, LedgerError> {
        let state = self.state.lock().await;
        if let LockingScript::PayToPolicy(hash) = script {
            if !state.watched.contains(hash) {
                return Ok(Vec::new());
            }
        }

        let mut utxos: Vec<Utxo> = state
            .utxos
            .values()
            .filter(|u| u.script == *script)
            .copied()
            .collect();
        utxos.sort_by_key(|u| (u.height.unwrap_or(u32::MAX), u.outpoint));
        Ok(utxos)
    }

    async fn import_descriptor(&self, descriptor: &JointDescriptor) -> std::result::Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if state.watched.insert(descriptor.descriptor_ref()) {
            debug!(descriptor = %descriptor, "Imported descriptor");
        }
        Ok(())
    }

    async fn broadcast(&self, tx: &SettlementTransaction) -> std::result::Result<Txid, LedgerError> {
        let txid = tx.txid();
        let mut state = self.state.lock().await;

        match state.transactions.get(&txid) {
            Some(Some(_)) => {
                return Err(LedgerError::Rejected(
                    "transaction already in block chain".to_string(),
                ))
            }
            Some(None) => return Err(LedgerError::Rejected("txn-already-in-mempool".to_string())),
            None => {}
        }

        if let Err(reason) = state.validate(tx) {
            warn!(txid = %txid, reason = %reason, "Rejected transaction");
            return Err(LedgerError::Rejected(reason));
        }

        for input in &tx.inputs {
            state.utxos.remove(&input.outpoint);
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(txid, vout as u32);
            state.utxos.insert(
                outpoint,
                Utxo {
                    outpoint,
                    script: output.script,
                    asset: output.asset,
                    commitment: output.commitment,
                    ephemeral_pubkey: output.ephemeral_pubkey,
                    rewind: output.rewind,
                    height: None,
                },
            );
        }
        state.transactions.insert(txid, None);

        if self.mine_on_accept {
            let height = state.mine_block();
            info!(txid = %txid, height, "Accepted and mined transaction");
        } else {
            info!(txid = %txid, "Accepted transaction to mempool");
        }
        Ok(txid)
    }

    async fn transaction_status(&self, txid: &Txid) -> std::result::Result<TxStatus, LedgerError> {
        let state = self.state.lock().await;
        Ok(match state.transactions.get(txid) {
            None => TxStatus::Unknown,
            Some(None) => TxStatus::Mempool,
            Some(Some(height)) => TxStatus::Confirmed {
                height: *height,
                confirmations: state.height - height + 1,
            },
        })
    }
}
