//! Ledger engine boundary
//!
//! The coordinator never talks to a node directly; everything it needs from
//! the chain goes through [`LedgerEngine`].

pub mod memory;
pub mod retry;

use crate::crypto::{BlindingPublicKey, RewindPayload, ValueCommitment};
use crate::descriptor::{JointDescriptor, LockingScript};
use crate::error::LedgerError;
use crate::settlement::SettlementTransaction;
use crate::types::{AssetId, OutPoint, Txid};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryLedger;
pub use retry::{GuardedLedger, RetryConfig};

/// Unspent confidential output as reported by the ledger
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub script: LockingScript,
    pub asset: AssetId,
    pub commitment: ValueCommitment,
    pub ephemeral_pubkey: BlindingPublicKey,
    pub rewind: RewindPayload,
    /// Block the output confirmed in; `None` while in the mempool
    pub height: Option<u32>,
}

impl Utxo {
    /// Confirmations at `tip`; zero while unconfirmed
    pub fn confirmations(&self, tip: u32) -> u32 {
        match self.height {
            Some(height) if tip >= height => tip - height + 1,
            _ => 0,
        }
    }
}

/// Ledger view of a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TxStatus {
    Unknown,
    Mempool,
    Confirmed { height: u32, confirmations: u32 },
}

/// Chain access required by the settlement coordinator
#[async_trait]
pub trait LedgerEngine: Send + Sync {
    /// Height of the best block
    async fn tip_height(&self) -> Result<u32, LedgerError>;

    /// Unspent outputs locked to `script`
    async fn list_unspent(&self, script: &LockingScript) -> Result<Vec<Utxo>, LedgerError>;

    /// Start watching the joint descriptor's address
    async fn import_descriptor(&self, descriptor: &JointDescriptor) -> Result<(), LedgerError>;

    /// Submit a finalized transaction; rejections carry the engine's reason
    async fn broadcast(&self, tx: &SettlementTransaction) -> Result<Txid, LedgerError>;

    async fn transaction_status(&self, txid: &Txid) -> Result<TxStatus, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{blind_output, BlindingFactor, BlindingSecretKey, PaymentSecretKey};
    use crate::types::Hash;

    #[test]
    fn test_confirmations() {
        let blinded = blind_output(
            &AssetId::from_label("USDT"),
            1,
            &BlindingFactor::random(),
            &BlindingSecretKey::random().public_key(),
        )
        .unwrap();
        let mut utxo = Utxo {
            outpoint: OutPoint::new(Txid(Hash::from_bytes(b"tx")), 0),
            script: LockingScript::PayToKey(PaymentSecretKey::random().public_key()),
            asset: AssetId::from_label("USDT"),
            commitment: blinded.commitment,
            ephemeral_pubkey: blinded.ephemeral_pubkey,
            rewind: blinded.rewind,
            height: Some(100),
        };

        assert_eq!(utxo.confirmations(100), 1);
        assert_eq!(utxo.confirmations(249), 150);
        assert_eq!(utxo.confirmations(99), 0);

        utxo.height = None;
        assert_eq!(utxo.confirmations(500), 0);
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&TxStatus::Confirmed {
            height: 7,
            confirmations: 1,
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"confirmed","height":7,"confirmations":1}"#);
    }
}
