//! Application wiring desks, negotiation and settlement over one ledger

use crate::config::AppConfig;
use crate::crypto::PaymentPublicKey;
use crate::descriptor::build_joint_timelocked_address;
use crate::error::{Result, SettlementError};
use crate::identity::{IdentityRegistry, ParticipantKeyset};
use crate::ledger::{GuardedLedger, LedgerEngine, MemoryLedger};
use crate::negotiation::{NegotiationEngine, OtcDesk, Rfq};
use crate::settlement::{SettlementCoordinator, SettlementStatus};
use crate::types::{AssetId, Clock, ParticipantId, Side, SystemClock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const CLIENT_ID: &str = "client";

/// Parameters of one demo run
#[derive(Debug, Clone)]
pub struct DemoParams {
    pub size: u64,
    pub reference_price: Decimal,
    pub side: Side,
    pub reclaim_after: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteSummary {
    pub dealer: String,
    pub price: Decimal,
    pub size: u64,
}

/// What happened in a demo run
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub rfq_id: String,
    pub quotes: Vec<QuoteSummary>,
    pub declined: Vec<String>,
    pub selected_dealer: String,
    pub selected_price: Decimal,
    pub txid: String,
    pub status: SettlementStatus,
    pub descriptor: String,
    pub joint_address: String,
    /// Outcome of the client's reclaim attempt after settlement
    pub reclaim_after_settlement: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeygenReport {
    pub participant_id: String,
    pub identity_pubkey: String,
    pub payment_pubkey: String,
    pub wallet_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DescriptorReport {
    pub descriptor: String,
    pub address: String,
    pub unconfidential: String,
}

/// Demo application on the in-memory regtest ledger
pub struct OtcApp {
    config: AppConfig,
    ledger: Arc<MemoryLedger>,
    clock: Arc<dyn Clock>,
}

impl OtcApp {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let ledger = if config.ledger.mine_on_accept {
            MemoryLedger::new()
        } else {
            MemoryLedger::manual_mining()
        };

        Ok(Self {
            config,
            ledger: Arc::new(ledger),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn ledger(&self) -> Arc<MemoryLedger> {
        self.ledger.clone()
    }

    fn guarded_ledger(&self) -> GuardedLedger {
        GuardedLedger::new(
            self.ledger.clone() as Arc<dyn LedgerEngine>,
            self.config.call_timeout(),
            self.config.ledger.retry.clone(),
        )
    }

    /// RFQ to every configured desk, settle the best quote, then show that
    /// the client cannot reclaim the spent joint output
    pub async fn run_demo(&self, params: DemoParams) -> Result<DemoReport> {
        let desks = self.config.desks_or_demo();
        let client = ParticipantKeyset::from_seed(ParticipantId::new(CLIENT_ID), CLIENT_ID.as_bytes());

        let mut registry = IdentityRegistry::new();
        registry.register(client.participant_id().clone(), client.identity_pubkey());

        let mut dealers = HashMap::new();
        let mut desk_params = Vec::new();
        for desk in &desks {
            let keys = ParticipantKeyset::from_seed(
                ParticipantId::new(desk.dealer_id.as_str()),
                desk.dealer_id.as_bytes(),
            );
            registry.register(keys.participant_id().clone(), keys.identity_pubkey());
            desk_params.push((keys.clone(), desk.params()?));
            dealers.insert(keys.participant_id().clone(), keys);
        }
        let registry = Arc::new(registry);

        let pair = desk_params
            .iter()
            .flat_map(|(_, p)| p.pairs.iter().copied())
            .next()
            .ok_or_else(|| SettlementError::Configuration("no desk quotes any pair".to_string()))?;

        let fee_asset = AssetId::from_label(&self.config.settlement.fee_asset);
        self.fund_participants(&client, &desk_params, &params, pair.base, pair.quote, fee_asset)
            .await?;

        let mut engine = NegotiationEngine::new(registry.clone(), self.clock.clone(), self.config.collection_timeout());
        for (keys, desk) in desk_params {
            engine.add_provider(Arc::new(OtcDesk::new(keys, desk, self.clock.clone())));
        }

        let now = self.clock.now();
        let rfq = Rfq::new(
            &client,
            pair,
            params.side,
            params.size,
            params.reference_price,
            now + self.config.negotiation.rfq_ttl_secs,
            now,
        )?;
        let round = engine.collect_quotes(&rfq).await?;
        let best = round
            .best(rfq.side())
            .cloned()
            .ok_or_else(|| SettlementError::NoQuotes(rfq.id().to_string()))?;
        let dealer = dealers
            .get(best.dealer_id())
            .ok_or_else(|| SettlementError::InvalidKey(format!("no keys for {}", best.dealer_id())))?;

        let settlement_config = self.config.settlement_config();
        let coordinator = SettlementCoordinator::new(
            self.guarded_ledger(),
            registry,
            settlement_config.clone(),
            self.clock.clone(),
        );
        let tx = coordinator
            .create_atomic_settlement(&rfq, &best, &client, dealer)
            .await?;

        let (address, descriptor) = build_joint_timelocked_address(
            client.payment_pubkey(),
            dealer.payment_pubkey(),
            settlement_config.csv_delay,
        )?;

        self.ledger.generate(params.reclaim_after).await;
        let reclaim_after_settlement = match coordinator.reclaim(&descriptor, &client).await {
            Ok(reclaim) => {
                warn!(txid = %reclaim.txid(), "Reclaim unexpectedly succeeded after settlement");
                format!("reclaimed in {}", reclaim.txid())
            }
            Err(e) => {
                info!(error = %e, "Reclaim refused after settlement");
                format!("refused: {}", e)
            }
        };

        Ok(DemoReport {
            rfq_id: rfq.id().to_string(),
            quotes: round
                .accepted
                .iter()
                .map(|q| QuoteSummary {
                    dealer: q.dealer_id().to_string(),
                    price: q.price(),
                    size: q.size(),
                })
                .collect(),
            declined: round
                .declined
                .iter()
                .map(|(dealer, reason)| format!("{}: {}", dealer, reason))
                .collect(),
            selected_dealer: best.dealer_id().to_string(),
            selected_price: best.price(),
            txid: tx.txid().to_string(),
            status: tx.status(),
            descriptor: descriptor.to_descriptor_string(),
            joint_address: address.to_string(),
            reclaim_after_settlement,
        })
    }

    /// Faucet the client with both sides of the trade and each desk with its
    /// configured inventory
    async fn fund_participants(
        &self,
        client: &ParticipantKeyset,
        desks: &[(ParticipantKeyset, crate::negotiation::DeskParams)],
        params: &DemoParams,
        base: AssetId,
        quote: AssetId,
        fee_asset: AssetId,
    ) -> Result<()> {
        let notional = crate::negotiation::payment_for(params.size, params.reference_price)?;
        let fee_buffer = self.config.settlement.fee.saturating_mul(10);

        let client_address = client.wallet_address();
        self.ledger.fund(&client_address, quote, notional.saturating_mul(2)).await?;
        self.ledger.fund(&client_address, base, params.size.saturating_mul(2)).await?;
        if fee_asset != base && fee_asset != quote {
            self.ledger.fund(&client_address, fee_asset, fee_buffer).await?;
        }

        for (keys, desk) in desks {
            let address = keys.wallet_address();
            for (asset, amount) in &desk.inventory {
                if *amount > 0 {
                    self.ledger.fund(&address, *asset, *amount).await?;
                }
            }
            if !desk.inventory.contains_key(&fee_asset) {
                self.ledger.fund(&address, fee_asset, fee_buffer).await?;
            }
        }
        info!(desks = desks.len(), "Funded demo participants");
        Ok(())
    }
}

/// Deterministic keyset for `participant_id` from `seed`
pub fn keygen(participant_id: &str, seed: &str) -> KeygenReport {
    let keys = ParticipantKeyset::from_seed(ParticipantId::new(participant_id), seed.as_bytes());
    KeygenReport {
        participant_id: participant_id.to_string(),
        identity_pubkey: keys.identity_pubkey().to_hex(),
        payment_pubkey: keys.payment_pubkey().to_hex(),
        wallet_address: keys.wallet_address().to_string(),
    }
}

/// Joint descriptor for two hex payment keys
pub fn derive_descriptor(client: &str, dealer: &str, csv_delay: u32) -> Result<DescriptorReport> {
    let client = PaymentPublicKey::from_hex(client)?;
    let dealer = PaymentPublicKey::from_hex(dealer)?;
    let (address, descriptor) = build_joint_timelocked_address(client, dealer, csv_delay)?;

    Ok(DescriptorReport {
        descriptor: descriptor.to_descriptor_string(),
        address: address.to_string(),
        unconfidential: address.unconfidential(),
    })
}
