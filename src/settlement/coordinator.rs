//! Atomic settlement coordinator
//!
//! Drives one settlement through select, fund, derive, construct, sign,
//! finalize and broadcast. Each step consumes the previous step's output, so
//! steps cannot be skipped or reordered. Reserved inputs are released when the
//! attempt's state is dropped, whether it completed or aborted.

use crate::descriptor::{build_joint_timelocked_address, ConfidentialAddress, JointDescriptor, SpendBranch};
use crate::error::{LedgerError, Result, SettlementError};
use crate::identity::{IdentityRegistry, ParticipantKeyset};
use crate::ledger::{GuardedLedger, TxStatus};
use crate::negotiation::{verify_quote, verify_rfq_signature, Quote, Rfq, TradeLegs};
use crate::types::{AssetId, Clock, Role, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::builder::{build_blinded_transaction, InputSpec, OutputSpec};
use super::reservation::{ReservationGuard, UtxoReservations};
use super::signing::{finalize_transaction, sign_transaction};
use super::types::{InputPlan, SettlementStatus, SettlementTransaction, SEQUENCE_FINAL};
use super::wallet::{self, OwnedCoin};

/// Settlement parameters shared by every attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Relative timelock on the client's reclaim branch, in blocks
    pub csv_delay: u32,
    /// Flat fee per transaction
    pub fee: u64,
    pub fee_asset: AssetId,
    /// Submissions attempted after ambiguous broadcast failures
    pub max_broadcast_attempts: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            csv_delay: 150,
            fee: 50,
            fee_asset: AssetId::from_label("L-BTC"),
            max_broadcast_attempts: 3,
        }
    }
}

/// Quote verified against its RFQ
#[derive(Debug, Clone)]
pub struct SelectedQuote {
    pub rfq: Rfq,
    pub quote: Quote,
    pub legs: TradeLegs,
}

/// Both parties' inputs nominated and reserved
#[derive(Debug)]
pub struct FundedSettlement {
    pub selected: SelectedQuote,
    pub client_coins: Vec<OwnedCoin>,
    pub dealer_coins: Vec<OwnedCoin>,
    client_requirements: BTreeMap<AssetId, u64>,
    dealer_requirements: BTreeMap<AssetId, u64>,
    reservation: ReservationGuard,
}

impl FundedSettlement {
    pub fn reservation(&self) -> &ReservationGuard {
        &self.reservation
    }
}

/// Client leg locked in the joint output
#[derive(Debug)]
pub struct DerivedSettlement {
    pub selected: SelectedQuote,
    pub descriptor: JointDescriptor,
    pub address: ConfidentialAddress,
    pub funding: SettlementTransaction,
    pub joint_coin: OwnedCoin,
    pub dealer_coins: Vec<OwnedCoin>,
    dealer_requirements: BTreeMap<AssetId, u64>,
    reservation: ReservationGuard,
}

/// Settlement transaction awaiting signatures
#[derive(Debug)]
pub struct PendingSettlement {
    pub transaction: SettlementTransaction,
    pub descriptor: JointDescriptor,
    pub funding_txid: Txid,
    reservation: ReservationGuard,
}

impl PendingSettlement {
    pub fn reservation(&self) -> &ReservationGuard {
        &self.reservation
    }

    /// Give up the reservation and keep the transaction
    pub fn into_transaction(self) -> SettlementTransaction {
        self.transaction
    }
}

/// Signed reclaim transaction; its joint and fee inputs stay reserved until
/// it is dropped
#[derive(Debug)]
pub struct PendingReclaim {
    pub transaction: SettlementTransaction,
    reservation: ReservationGuard,
}

impl PendingReclaim {
    pub fn reservation(&self) -> &ReservationGuard {
        &self.reservation
    }

    pub fn into_transaction(self) -> SettlementTransaction {
        self.transaction
    }
}

pub struct SettlementCoordinator {
    ledger: GuardedLedger,
    registry: Arc<IdentityRegistry>,
    reservations: UtxoReservations,
    config: SettlementConfig,
    clock: Arc<dyn Clock>,
}

impl SettlementCoordinator {
    pub fn new(
        ledger: GuardedLedger,
        registry: Arc<IdentityRegistry>,
        config: SettlementConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            registry,
            reservations: UtxoReservations::new(),
            config,
            clock,
        }
    }

    /// Share input reservations with other coordinators
    pub fn with_reservations(mut self, reservations: UtxoReservations) -> Self {
        self.reservations = reservations;
        self
    }

    pub fn ledger(&self) -> &GuardedLedger {
        &self.ledger
    }

    pub fn reservations(&self) -> &UtxoReservations {
        &self.reservations
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Run a full settlement of `quote` and return the broadcast transaction
    pub async fn create_atomic_settlement(
        &self,
        rfq: &Rfq,
        quote: &Quote,
        client_keys: &ParticipantKeyset,
        dealer_keys: &ParticipantKeyset,
    ) -> Result<SettlementTransaction> {
        let selected = self.select(rfq, quote)?;
        let funded = self.fund(selected, client_keys, dealer_keys).await?;
        let derived = self.derive(funded, client_keys, dealer_keys).await?;
        let mut pending = self.construct(derived, client_keys, dealer_keys)?;

        self.sign(&mut pending.transaction, client_keys)?;
        self.sign(&mut pending.transaction, dealer_keys)?;
        self.finalize(&mut pending.transaction)?;
        self.broadcast(&mut pending.transaction).await?;

        info!(
            rfq_id = %rfq.id(),
            txid = %pending.transaction.txid(),
            status = %pending.transaction.status(),
            "Settlement complete"
        );
        Ok(pending.into_transaction())
    }

    /// Verify the RFQ's client signature and the quote against its RFQ
    pub fn select(&self, rfq: &Rfq, quote: &Quote) -> Result<SelectedQuote> {
        verify_rfq_signature(rfq, &self.registry)?;
        verify_quote(rfq, quote, &self.registry, self.clock.now())?;
        let legs = quote.legs(rfq)?;

        info!(
            rfq_id = %rfq.id(),
            dealer = %quote.dealer_id(),
            price = %quote.price(),
            size = quote.size(),
            "Selected quote"
        );
        Ok(SelectedQuote {
            rfq: rfq.clone(),
            quote: quote.clone(),
            legs,
        })
    }

    /// Nominate and reserve inputs for both parties.
    ///
    /// The client covers its leg plus the funding fee, the dealer its leg
    /// plus the settlement fee.
    pub async fn fund(
        &self,
        selected: SelectedQuote,
        client_keys: &ParticipantKeyset,
        dealer_keys: &ParticipantKeyset,
    ) -> Result<FundedSettlement> {
        let mut client_requirements = BTreeMap::new();
        wallet::require(
            &mut client_requirements,
            selected.legs.client_gives.asset,
            selected.legs.client_gives.amount,
        )?;
        wallet::require(&mut client_requirements, self.config.fee_asset, self.config.fee)?;

        let mut dealer_requirements = BTreeMap::new();
        wallet::require(
            &mut dealer_requirements,
            selected.legs.dealer_gives.asset,
            selected.legs.dealer_gives.amount,
        )?;
        wallet::require(&mut dealer_requirements, self.config.fee_asset, self.config.fee)?;

        let client_available = wallet::spendable_coins(&self.ledger, client_keys, &self.reservations).await?;
        let client_coins = wallet::select_coins(&client_available, &client_requirements, Role::Client)?;
        let dealer_available = wallet::spendable_coins(&self.ledger, dealer_keys, &self.reservations).await?;
        let dealer_coins = wallet::select_coins(&dealer_available, &dealer_requirements, Role::Dealer)?;

        let outpoints: Vec<_> = client_coins
            .iter()
            .chain(&dealer_coins)
            .map(|c| c.utxo.outpoint)
            .collect();
        let reservation = self.reservations.reserve(&outpoints)?;

        info!(
            rfq_id = %selected.rfq.id(),
            client_inputs = client_coins.len(),
            dealer_inputs = dealer_coins.len(),
            "Funded settlement"
        );
        Ok(FundedSettlement {
            selected,
            client_coins,
            dealer_coins,
            client_requirements,
            dealer_requirements,
            reservation,
        })
    }

    /// Build the joint descriptor, watch it, and lock the client's leg in it
    pub async fn derive(
        &self,
        funded: FundedSettlement,
        client_keys: &ParticipantKeyset,
        dealer_keys: &ParticipantKeyset,
    ) -> Result<DerivedSettlement> {
        let (address, descriptor) = build_joint_timelocked_address(
            client_keys.payment_pubkey(),
            dealer_keys.payment_pubkey(),
            self.config.csv_delay,
        )?;
        self.ledger.import_descriptor(&descriptor).await?;

        let leg = funded.selected.legs.client_gives;
        let inputs: Vec<InputSpec> = funded
            .client_coins
            .iter()
            .map(|coin| InputSpec {
                coin: *coin,
                plan: InputPlan::Key {
                    pubkey: client_keys.payment_pubkey(),
                },
                sequence: SEQUENCE_FINAL,
            })
            .collect();

        let mut outputs = vec![OutputSpec {
            address,
            asset: leg.asset,
            amount: leg.amount,
        }];
        let client_change = client_keys.wallet_address();
        for (asset, amount) in wallet::change(&funded.client_coins, &funded.client_requirements)? {
            outputs.push(OutputSpec {
                address: client_change,
                asset,
                amount,
            });
        }

        let mut funding = build_blinded_transaction(
            &inputs,
            &outputs,
            self.config.fee,
            self.config.fee_asset,
            Some(descriptor.descriptor_ref()),
        )?;
        sign_transaction(&mut funding, client_keys.payment())?;
        finalize_transaction(&mut funding)?;
        let funding_txid = self.broadcast(&mut funding).await?;

        let joint_coin = self.locate_joint_output(&descriptor, &funding_txid).await?;
        let mut reservation = funded.reservation;
        reservation.extend(&[joint_coin.utxo.outpoint])?;
        info!(
            descriptor = %descriptor,
            funding_txid = %funding_txid,
            csv_delay = descriptor.csv_delay(),
            "Joint output funded"
        );

        Ok(DerivedSettlement {
            selected: funded.selected,
            descriptor,
            address,
            funding,
            joint_coin,
            dealer_coins: funded.dealer_coins,
            dealer_requirements: funded.dealer_requirements,
            reservation,
        })
    }

    async fn locate_joint_output(&self, descriptor: &JointDescriptor, funding_txid: &Txid) -> Result<OwnedCoin> {
        let utxos = self.ledger.list_unspent(&descriptor.locking_script()).await?;
        let funded: Vec<_> = utxos
            .into_iter()
            .filter(|u| u.outpoint.txid == *funding_txid)
            .collect();
        wallet::unblind_all(&funded, &descriptor.blinding_secret())
            .into_iter()
            .next()
            .ok_or_else(|| SettlementError::FundingOutputNotFound(descriptor.to_descriptor_string()))
    }

    /// Unsigned transaction swapping the joint output and the dealer's inputs
    pub fn construct(
        &self,
        derived: DerivedSettlement,
        client_keys: &ParticipantKeyset,
        dealer_keys: &ParticipantKeyset,
    ) -> Result<PendingSettlement> {
        let mut inputs = vec![InputSpec {
            coin: derived.joint_coin,
            plan: InputPlan::Policy {
                script: derived.descriptor.policy_script().clone(),
                branch: SpendBranch::Cosign,
            },
            sequence: SEQUENCE_FINAL,
        }];
        inputs.extend(derived.dealer_coins.iter().map(|coin| InputSpec {
            coin: *coin,
            plan: InputPlan::Key {
                pubkey: dealer_keys.payment_pubkey(),
            },
            sequence: SEQUENCE_FINAL,
        }));

        let legs = derived.selected.legs;
        let dealer_address = dealer_keys.wallet_address();
        let mut outputs = vec![
            OutputSpec {
                address: client_keys.wallet_address(),
                asset: legs.dealer_gives.asset,
                amount: legs.dealer_gives.amount,
            },
            OutputSpec {
                address: dealer_address,
                asset: legs.client_gives.asset,
                amount: derived.joint_coin.amount(),
            },
        ];
        for (asset, amount) in wallet::change(&derived.dealer_coins, &derived.dealer_requirements)? {
            outputs.push(OutputSpec {
                address: dealer_address,
                asset,
                amount,
            });
        }

        let transaction = build_blinded_transaction(
            &inputs,
            &outputs,
            self.config.fee,
            self.config.fee_asset,
            Some(derived.descriptor.descriptor_ref()),
        )?;
        info!(
            txid = %transaction.txid(),
            inputs = transaction.inputs.len(),
            outputs = transaction.outputs.len(),
            "Constructed settlement transaction"
        );

        Ok(PendingSettlement {
            transaction,
            descriptor: derived.descriptor,
            funding_txid: derived.funding.txid(),
            reservation: derived.reservation,
        })
    }

    /// Add `keys`' signatures to the inputs it controls
    pub fn sign(&self, tx: &mut SettlementTransaction, keys: &ParticipantKeyset) -> Result<Vec<usize>> {
        let signed = sign_transaction(tx, keys.payment())?;
        info!(
            txid = %tx.txid(),
            participant = %keys.participant_id(),
            inputs = ?signed,
            "Partial signature added"
        );
        Ok(signed)
    }

    pub fn finalize(&self, tx: &mut SettlementTransaction) -> Result<()> {
        finalize_transaction(tx)?;
        info!(txid = %tx.txid(), "Settlement transaction finalized");
        Ok(())
    }

    /// Submit a finalized transaction without ever double-submitting it.
    ///
    /// The ledger is asked about the txid first; an already known transaction
    /// is not sent again. After an ambiguous failure the status is checked
    /// before the next bounded attempt.
    pub async fn broadcast(&self, tx: &mut SettlementTransaction) -> Result<Txid> {
        if !matches!(
            tx.status(),
            SettlementStatus::Finalized | SettlementStatus::Broadcast | SettlementStatus::Confirmed
        ) {
            return Err(SettlementError::InvalidStateTransition(format!(
                "cannot broadcast a {} transaction",
                tx.status()
            )));
        }

        let txid = tx.txid();
        let known = self.ledger.transaction_status(&txid).await?;
        if known != TxStatus::Unknown {
            info!(txid = %txid, status = ?known, "Transaction already known to ledger, not resubmitting");
            record_status(tx, known)?;
            return Ok(txid);
        }

        let retry = self.ledger.retry_config();
        let mut delay_ms = retry.initial_delay_ms;
        let attempts = self.config.max_broadcast_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.ledger.broadcast(tx).await {
                Ok(_) => {
                    info!(txid = %txid, attempt, "Broadcast accepted");
                    record_status(tx, TxStatus::Mempool)?;
                    self.refresh_status(tx).await?;
                    return Ok(txid);
                }
                Err(LedgerError::Rejected(reason)) => {
                    if reason.contains("already") {
                        let status = self.ledger.transaction_status(&txid).await?;
                        if status != TxStatus::Unknown {
                            record_status(tx, status)?;
                            return Ok(txid);
                        }
                    }
                    warn!(txid = %txid, reason = %reason, "Broadcast rejected");
                    tx.set_status(SettlementStatus::Rejected)?;
                    return Err(SettlementError::Broadcast(reason));
                }
                Err(e) if e.is_ambiguous() => {
                    warn!(txid = %txid, attempt, error = %e, "Broadcast outcome unknown, checking status");
                    match self.ledger.transaction_status(&txid).await {
                        Ok(TxStatus::Unknown) => {}
                        Ok(status) => {
                            info!(txid = %txid, status = ?status, "Earlier submission was applied");
                            record_status(tx, status)?;
                            return Ok(txid);
                        }
                        Err(status_error) => {
                            warn!(txid = %txid, error = %status_error, "Status lookup failed");
                        }
                    }
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        delay_ms = retry.next_delay(delay_ms);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error
            .map(SettlementError::Ledger)
            .unwrap_or_else(|| SettlementError::Broadcast("no broadcast attempted".to_string())))
    }

    async fn refresh_status(&self, tx: &mut SettlementTransaction) -> Result<()> {
        match self.ledger.transaction_status(&tx.txid()).await {
            Ok(status) => record_status(tx, status),
            Err(e) => {
                warn!(txid = %tx.txid(), error = %e, "Could not refresh transaction status");
                Ok(())
            }
        }
    }

    /// Client's unilateral spend of every joint output back to its wallet.
    ///
    /// Built and signed without checking maturity; the ledger refuses it until
    /// the joint output has `csv_delay` confirmations. Every input, including
    /// fee coins taken from the client wallet, is reserved for as long as the
    /// returned reclaim is held.
    pub async fn build_reclaim(
        &self,
        descriptor: &JointDescriptor,
        client_keys: &ParticipantKeyset,
    ) -> Result<PendingReclaim> {
        if descriptor.client_payment_pubkey() != client_keys.payment_pubkey() {
            return Err(SettlementError::InvalidKey(
                "reclaim key does not match the descriptor's client key".to_string(),
            ));
        }

        let joint_coins = self.joint_coins(descriptor).await?;
        let mut inputs: Vec<InputSpec> = joint_coins
            .iter()
            .map(|coin| InputSpec {
                coin: *coin,
                plan: InputPlan::Policy {
                    script: descriptor.policy_script().clone(),
                    branch: SpendBranch::Reclaim,
                },
                sequence: descriptor.csv_delay(),
            })
            .collect();

        let joint_fee_funds = wallet::totals(&joint_coins)?
            .get(&self.config.fee_asset)
            .copied()
            .unwrap_or(0);
        if joint_fee_funds < self.config.fee {
            let mut requirements = BTreeMap::new();
            wallet::require(&mut requirements, self.config.fee_asset, self.config.fee)?;
            let available = wallet::spendable_coins(&self.ledger, client_keys, &self.reservations).await?;
            let fee_coins = wallet::select_coins(&available, &requirements, Role::Client)?;
            inputs.extend(fee_coins.into_iter().map(|coin| InputSpec {
                coin,
                plan: InputPlan::Key {
                    pubkey: client_keys.payment_pubkey(),
                },
                sequence: SEQUENCE_FINAL,
            }));
        }

        let outpoints: Vec<_> = inputs.iter().map(|input| input.coin.utxo.outpoint).collect();
        let reservation = self.reservations.reserve(&outpoints)?;

        let spent: Vec<OwnedCoin> = inputs.iter().map(|input| input.coin).collect();
        let mut fee_due = BTreeMap::new();
        wallet::require(&mut fee_due, self.config.fee_asset, self.config.fee)?;
        let address = client_keys.wallet_address();
        let outputs: Vec<OutputSpec> = wallet::change(&spent, &fee_due)?
            .into_iter()
            .map(|(asset, amount)| OutputSpec { address, asset, amount })
            .collect();

        let mut tx = build_blinded_transaction(
            &inputs,
            &outputs,
            self.config.fee,
            self.config.fee_asset,
            Some(descriptor.descriptor_ref()),
        )?;
        sign_transaction(&mut tx, client_keys.payment())?;
        finalize_transaction(&mut tx)?;
        Ok(PendingReclaim {
            transaction: tx,
            reservation,
        })
    }

    /// Reclaim the joint output once its timelock has matured
    pub async fn reclaim(
        &self,
        descriptor: &JointDescriptor,
        client_keys: &ParticipantKeyset,
    ) -> Result<SettlementTransaction> {
        let joint_coins = self.joint_coins(descriptor).await?;
        let tip = self.ledger.tip_height().await?;
        let current = joint_coins
            .iter()
            .map(|c| c.utxo.confirmations(tip))
            .min()
            .unwrap_or(0);
        if current < descriptor.csv_delay() {
            warn!(
                descriptor = %descriptor,
                confirmations = current,
                required = descriptor.csv_delay(),
                "Reclaim attempted before timelock maturity"
            );
            return Err(SettlementError::TimelockNotMature {
                current,
                required: descriptor.csv_delay(),
            });
        }

        let mut pending = self.build_reclaim(descriptor, client_keys).await?;
        let txid = self.broadcast(&mut pending.transaction).await?;
        info!(descriptor = %descriptor, txid = %txid, "Joint output reclaimed");
        Ok(pending.into_transaction())
    }

    async fn joint_coins(&self, descriptor: &JointDescriptor) -> Result<Vec<OwnedCoin>> {
        self.ledger.import_descriptor(descriptor).await?;
        let utxos = self.ledger.list_unspent(&descriptor.locking_script()).await?;
        let coins = wallet::unblind_all(&utxos, &descriptor.blinding_secret());
        if coins.is_empty() {
            return Err(SettlementError::FundingOutputNotFound(
                descriptor.to_descriptor_string(),
            ));
        }
        Ok(coins)
    }
}

fn record_status(tx: &mut SettlementTransaction, status: TxStatus) -> Result<()> {
    let next = match status {
        TxStatus::Unknown => return Ok(()),
        TxStatus::Mempool => SettlementStatus::Broadcast,
        TxStatus::Confirmed { .. } => SettlementStatus::Confirmed,
    };
    match (tx.status(), next) {
        (current, next) if current == next => Ok(()),
        (SettlementStatus::Confirmed, _) => Ok(()),
        _ => tx.set_status(next),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerEngine, MemoryLedger, RetryConfig};
    use crate::types::{AssetPair, ManualClock, ParticipantId, Side};
    use rust_decimal::Decimal;

    const NOW: u64 = 1_700_000_000;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        coordinator: SettlementCoordinator,
        client: ParticipantKeyset,
        dealer: ParticipantKeyset,
        rfq: Rfq,
        quote: Quote,
    }

    fn usdt() -> AssetId {
        AssetId::from_label("USDT")
    }

    fn lbtc() -> AssetId {
        AssetId::from_label("L-BTC")
    }

    fn buy_rfq(client: &ParticipantKeyset, size: u64) -> Rfq {
        Rfq::new(
            client,
            AssetPair::new(lbtc(), usdt()),
            Side::Buy,
            size,
            Decimal::new(10000, 2),
            NOW + 300,
            NOW,
        )
        .unwrap()
    }

    async fn fixture(csv_delay: u32) -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let client = ParticipantKeyset::from_seed(ParticipantId::new("client"), b"coordinator");
        let dealer = ParticipantKeyset::from_seed(ParticipantId::new("desk-a"), b"coordinator");

        let mut registry = IdentityRegistry::new();
        registry.register(client.participant_id().clone(), client.identity_pubkey());
        registry.register(dealer.participant_id().clone(), dealer.identity_pubkey());

        let rfq = buy_rfq(&client, 1_000);
        let quote = Quote::new(&rfq, &dealer, Decimal::new(10010, 2), 1_000, NOW + 60).unwrap();

        ledger.fund(&client.wallet_address(), usdt(), 150_000).await.unwrap();
        ledger.fund(&client.wallet_address(), lbtc(), 500).await.unwrap();
        ledger.fund(&dealer.wallet_address(), lbtc(), 5_000).await.unwrap();

        let guarded = GuardedLedger::new(
            ledger.clone() as Arc<dyn LedgerEngine>,
            Duration::from_secs(2),
            RetryConfig::default(),
        );
        let coordinator = SettlementCoordinator::new(
            guarded,
            Arc::new(registry),
            SettlementConfig {
                csv_delay,
                ..SettlementConfig::default()
            },
            Arc::new(ManualClock::new(NOW)),
        );

        Fixture {
            ledger,
            coordinator,
            client,
            dealer,
            rfq,
            quote,
        }
    }

    async fn balance(ledger: &MemoryLedger, keys: &ParticipantKeyset, asset: AssetId) -> u64 {
        let utxos = ledger.list_unspent(&keys.wallet_script()).await.unwrap();
        wallet::unblind_all(&utxos, &keys.blinding_key_for(&keys.wallet_script()))
            .iter()
            .filter(|c| c.asset() == asset)
            .map(|c| c.amount())
            .sum()
    }

    #[tokio::test]
    async fn test_settlement_swaps_legs() {
        let f = fixture(150).await;
        let tx = f
            .coordinator
            .create_atomic_settlement(&f.rfq, &f.quote, &f.client, &f.dealer)
            .await
            .unwrap();

        assert_eq!(tx.status(), SettlementStatus::Confirmed);
        assert!(f.coordinator.reservations().is_empty());

        // 100.10 * 1000 USDT to the dealer, 1000 L-BTC to the client
        assert_eq!(balance(&f.ledger, &f.client, usdt()).await, 150_000 - 100_100);
        assert_eq!(balance(&f.ledger, &f.dealer, usdt()).await, 100_100);
        assert_eq!(balance(&f.ledger, &f.client, lbtc()).await, 500 - 50 + 1_000);
        assert_eq!(balance(&f.ledger, &f.dealer, lbtc()).await, 5_000 - 1_000 - 50);
    }

    #[tokio::test]
    async fn test_insufficient_dealer_funds() {
        let f = fixture(150).await;
        let rfq = buy_rfq(&f.client, 10_000);
        let quote = Quote::new(&rfq, &f.dealer, Decimal::new(1001, 2), 10_000, NOW + 60).unwrap();

        let selected = f.coordinator.select(&rfq, &quote).unwrap();
        let err = f.coordinator.fund(selected, &f.client, &f.dealer).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::InsufficientFunds {
                party: Role::Dealer,
                required: 10_050,
                available: 5_000,
                ..
            }
        ));
        assert!(f.coordinator.reservations().is_empty());
    }

    #[tokio::test]
    async fn test_forged_quote_rejected_at_select() {
        let f = fixture(150).await;
        let impostor = ParticipantKeyset::from_seed(ParticipantId::new("desk-a"), b"impostor");
        let quote = Quote::new(&f.rfq, &impostor, Decimal::new(9000, 2), 1_000, NOW + 60).unwrap();

        assert!(matches!(
            f.coordinator.select(&f.rfq, &quote),
            Err(SettlementError::QuoteRejected(crate::error::QuoteRejection::BadSignature))
        ));
    }

    #[tokio::test]
    async fn test_forged_rfq_rejected_at_select() {
        let f = fixture(150).await;
        let impostor = ParticipantKeyset::from_seed(ParticipantId::new("client"), b"impostor");
        let rfq = buy_rfq(&impostor, 1_000);
        let quote = Quote::new(&rfq, &f.dealer, Decimal::new(10010, 2), 1_000, NOW + 60).unwrap();

        assert!(matches!(
            f.coordinator.select(&rfq, &quote),
            Err(SettlementError::RfqValidation(msg)) if msg.contains("client")
        ));
    }

    #[tokio::test]
    async fn test_rebroadcast_is_noop() {
        let f = fixture(150).await;
        let mut tx = f
            .coordinator
            .create_atomic_settlement(&f.rfq, &f.quote, &f.client, &f.dealer)
            .await
            .unwrap();
        let tip = f.ledger.tip_height().await.unwrap();

        let txid = f.coordinator.broadcast(&mut tx).await.unwrap();
        assert_eq!(txid, tx.txid());
        assert_eq!(tx.status(), SettlementStatus::Confirmed);
        assert_eq!(f.ledger.tip_height().await.unwrap(), tip);
    }

    #[tokio::test]
    async fn test_unsigned_transaction_cannot_broadcast() {
        let f = fixture(150).await;
        let selected = f.coordinator.select(&f.rfq, &f.quote).unwrap();
        let funded = f.coordinator.fund(selected, &f.client, &f.dealer).await.unwrap();
        let derived = f.coordinator.derive(funded, &f.client, &f.dealer).await.unwrap();
        let mut pending = f.coordinator.construct(derived, &f.client, &f.dealer).unwrap();

        // Only the client has signed: the co-sign branch is unsatisfied
        f.coordinator.sign(&mut pending.transaction, &f.client).unwrap();
        assert!(matches!(
            f.coordinator.finalize(&mut pending.transaction),
            Err(SettlementError::Signature { input: 0, .. })
        ));
        assert!(matches!(
            f.coordinator.broadcast(&mut pending.transaction).await,
            Err(SettlementError::InvalidStateTransition(_))
        ));
        assert!(!pending.reservation().outpoints().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_before_maturity() {
        let f = fixture(10).await;
        let selected = f.coordinator.select(&f.rfq, &f.quote).unwrap();
        let funded = f.coordinator.fund(selected, &f.client, &f.dealer).await.unwrap();
        let derived = f.coordinator.derive(funded, &f.client, &f.dealer).await.unwrap();
        let descriptor = derived.descriptor.clone();
        drop(derived);

        f.ledger.generate(8).await;
        assert!(matches!(
            f.coordinator.reclaim(&descriptor, &f.client).await,
            Err(SettlementError::TimelockNotMature {
                current: 9,
                required: 10
            })
        ));

        // The ledger enforces the same boundary on its own
        let mut early = f.coordinator.build_reclaim(&descriptor, &f.client).await.unwrap();
        assert!(matches!(
            f.coordinator.broadcast(&mut early.transaction).await,
            Err(SettlementError::Broadcast(reason)) if reason == "non-BIP68-final"
        ));
        assert_eq!(early.transaction.status(), SettlementStatus::Rejected);
        drop(early);

        f.ledger.generate(1).await;
        let tx = f.coordinator.reclaim(&descriptor, &f.client).await.unwrap();
        assert_eq!(tx.status(), SettlementStatus::Confirmed);
        assert_eq!(balance(&f.ledger, &f.client, usdt()).await, 150_000);
        assert_eq!(balance(&f.ledger, &f.client, lbtc()).await, 500 - 50 - 50);
    }

    #[tokio::test]
    async fn test_reclaim_requires_client_key_and_funds() {
        let f = fixture(10).await;
        let (_, descriptor) = build_joint_timelocked_address(
            f.client.payment_pubkey(),
            f.dealer.payment_pubkey(),
            10,
        )
        .unwrap();

        assert!(matches!(
            f.coordinator.build_reclaim(&descriptor, &f.dealer).await,
            Err(SettlementError::InvalidKey(_))
        ));
        assert!(matches!(
            f.coordinator.reclaim(&descriptor, &f.client).await,
            Err(SettlementError::FundingOutputNotFound(_))
        ));
    }

    /// Lock the client's 1000-lot leg in the joint output and let it mature
    async fn matured_joint_output(f: &Fixture) -> JointDescriptor {
        let selected = f.coordinator.select(&f.rfq, &f.quote).unwrap();
        let funded = f.coordinator.fund(selected, &f.client, &f.dealer).await.unwrap();
        let derived = f.coordinator.derive(funded, &f.client, &f.dealer).await.unwrap();
        let descriptor = derived.descriptor.clone();
        drop(derived);
        f.ledger.generate(descriptor.csv_delay() - 1).await;
        descriptor
    }

    #[tokio::test]
    async fn test_reclaim_holds_its_fee_coins() {
        let f = fixture(10).await;
        let descriptor = matured_joint_output(&f).await;

        // Joint output carries USDT only, so the fee comes from the client's
        // remaining 450 L-BTC coin
        let held = f.coordinator.build_reclaim(&descriptor, &f.client).await.unwrap();
        assert_eq!(held.reservation().outpoints().len(), 2);
        assert!(held
            .reservation()
            .outpoints()
            .iter()
            .all(|op| f.coordinator.reservations().is_reserved(op)));

        // Neither a new settlement nor a second reclaim can take that coin
        let rfq = buy_rfq(&f.client, 100);
        let quote = Quote::new(&rfq, &f.dealer, Decimal::new(10010, 2), 100, NOW + 60).unwrap();
        let selected = f.coordinator.select(&rfq, &quote).unwrap();
        assert!(matches!(
            f.coordinator.fund(selected, &f.client, &f.dealer).await,
            Err(SettlementError::InsufficientFunds {
                party: Role::Client,
                required: 50,
                available: 0,
                ..
            })
        ));
        assert!(matches!(
            f.coordinator.reclaim(&descriptor, &f.client).await,
            Err(SettlementError::InsufficientFunds { party: Role::Client, .. })
        ));

        drop(held);
        assert!(f.coordinator.reservations().is_empty());
        let tx = f.coordinator.reclaim(&descriptor, &f.client).await.unwrap();
        assert_eq!(tx.status(), SettlementStatus::Confirmed);
        assert_eq!(balance(&f.ledger, &f.client, usdt()).await, 150_000);
        assert_eq!(balance(&f.ledger, &f.client, lbtc()).await, 500 - 50 - 50);
    }

    #[tokio::test]
    async fn test_reclaim_and_settlement_never_double_spend() {
        let f = fixture(10).await;
        let descriptor = matured_joint_output(&f).await;

        let rfq = buy_rfq(&f.client, 100);
        let quote = Quote::new(&rfq, &f.dealer, Decimal::new(10010, 2), 100, NOW + 60).unwrap();

        let (reclaimed, settled) = tokio::join!(
            f.coordinator.reclaim(&descriptor, &f.client),
            f.coordinator.create_atomic_settlement(&rfq, &quote, &f.client, &f.dealer),
        );

        assert!(reclaimed.is_ok() || settled.is_ok());
        for err in [reclaimed.err(), settled.err()].into_iter().flatten() {
            assert!(
                matches!(
                    err,
                    SettlementError::InsufficientFunds { .. }
                        | SettlementError::InputReserved(_)
                        | SettlementError::TimelockNotMature { .. }
                ),
                "unexpected failure: {}",
                err
            );
        }
        assert!(f.coordinator.reservations().is_empty());
    }
}
