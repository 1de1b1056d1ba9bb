//! OTC desk: deterministic pricing of RFQs against a reference price

use crate::error::{QuoteRejection, Result, SettlementError};
use crate::identity::ParticipantKeyset;
use crate::types::{AssetId, AssetPair, Clock, ParticipantId, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::types::{payment_for, DeclineReason, Quote, Rfq, RfqResponse};

const BPS_DENOMINATOR: u32 = 10_000;

/// Anything that can answer an RFQ
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Participant id the provider signs quotes under
    fn dealer_id(&self) -> &ParticipantId;

    /// Price the RFQ or decline it
    async fn process_rfq(&self, rfq: &Rfq) -> RfqResponse;
}

/// Desk pricing parameters
#[derive(Clone, Debug)]
pub struct DeskParams {
    pub spread_bps: u32,
    pub quote_ttl_secs: u64,
    pub pairs: HashSet<AssetPair>,
    pub inventory: HashMap<AssetId, u64>,
}

impl DeskParams {
    /// Spread must stay below 100% so a sell price remains positive
    pub fn new(
        spread_bps: u32,
        quote_ttl_secs: u64,
        pairs: HashSet<AssetPair>,
        inventory: HashMap<AssetId, u64>,
    ) -> Result<Self> {
        if spread_bps >= BPS_DENOMINATOR {
            return Err(SettlementError::Configuration(format!(
                "spread_bps must be below {}, got {}",
                BPS_DENOMINATOR, spread_bps
            )));
        }
        Ok(Self {
            spread_bps,
            quote_ttl_secs,
            pairs,
            inventory,
        })
    }
}

/// Single-dealer desk quoting a fixed spread around the reference price
pub struct OtcDesk {
    keys: ParticipantKeyset,
    params: DeskParams,
    clock: Arc<dyn Clock>,
}

impl OtcDesk {
    pub fn new(keys: ParticipantKeyset, params: DeskParams, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys,
            params,
            clock,
        }
    }

    pub fn keys(&self) -> &ParticipantKeyset {
        &self.keys
    }

    pub fn params(&self) -> &DeskParams {
        &self.params
    }

    /// Reference price moved by the spread against the client
    pub fn price_for(&self, side: Side, reference_price: Decimal) -> Result<Decimal> {
        let spread = Decimal::from(self.params.spread_bps) / Decimal::from(BPS_DENOMINATOR);
        let factor = match side {
            Side::Buy => Decimal::ONE + spread,
            Side::Sell => Decimal::ONE - spread,
        };
        reference_price
            .checked_mul(factor)
            .map(|price| price.normalize())
            .ok_or_else(|| {
                SettlementError::RfqValidation(format!(
                    "reference price {} out of range for a {} bps spread",
                    reference_price, self.params.spread_bps
                ))
            })
    }

    fn available(&self, asset: &AssetId) -> u64 {
        self.params.inventory.get(asset).copied().unwrap_or(0)
    }

    fn decline(&self, rfq: &Rfq, reason: DeclineReason) -> RfqResponse {
        info!(
            dealer = %self.keys.participant_id(),
            rfq = %rfq.id(),
            reason = %reason,
            "Declining RFQ"
        );
        RfqResponse::Declined {
            dealer_id: self.keys.participant_id().clone(),
            reason,
        }
    }

    /// Synchronous pricing; `process_rfq` delegates here
    pub fn quote(&self, rfq: &Rfq) -> RfqResponse {
        let now = self.clock.now();
        if rfq.is_expired(now) {
            return self.decline(rfq, DeclineReason::Expired);
        }
        if !self.params.pairs.contains(&rfq.asset_pair()) {
            return self.decline(rfq, DeclineReason::UnsupportedPair);
        }

        let priced = self
            .price_for(rfq.side(), rfq.reference_price())
            .and_then(|price| payment_for(rfq.size(), price).map(|payment| (price, payment)));
        let (price, payment) = match priced {
            Ok(priced) => priced,
            Err(e) => {
                debug!(dealer = %self.keys.participant_id(), error = %e, "Cannot price RFQ");
                return self.decline(rfq, DeclineReason::PriceOutOfRange);
            }
        };
        let pair = rfq.asset_pair();

        // The desk's leg: base units when the client buys, payment when it sells
        let (asset, required) = match rfq.side() {
            Side::Buy => (pair.base, rfq.size()),
            Side::Sell => (pair.quote, payment),
        };
        if required > self.available(&asset) {
            debug!(
                dealer = %self.keys.participant_id(),
                required,
                available = self.available(&asset),
                "Leg exceeds inventory"
            );
            return self.decline(rfq, DeclineReason::InsufficientInventory);
        }

        let expiry = rfq
            .expiry()
            .min(now.saturating_add(self.params.quote_ttl_secs));

        match Quote::new(rfq, &self.keys, price, rfq.size(), expiry) {
            Ok(quote) => {
                info!(
                    dealer = %self.keys.participant_id(),
                    rfq = %rfq.id(),
                    price = %price,
                    size = rfq.size(),
                    expiry,
                    "Quoted RFQ"
                );
                RfqResponse::Quote(quote)
            }
            Err(e) => {
                debug!(dealer = %self.keys.participant_id(), error = %e, "Quote construction failed");
                self.decline(rfq, decline_reason_for(&e))
            }
        }
    }
}

fn decline_reason_for(rejection: &QuoteRejection) -> DeclineReason {
    match rejection {
        QuoteRejection::Expired { .. } => DeclineReason::Expired,
        QuoteRejection::Malformed(_) => DeclineReason::PriceOutOfRange,
        QuoteRejection::Oversized { .. }
        | QuoteRejection::OutlivesRfq { .. }
        | QuoteRejection::RfqMismatch
        | QuoteRejection::UnknownDealer(_)
        | QuoteRejection::BadSignature => DeclineReason::UnquotableTerms,
    }
}

#[async_trait]
impl QuoteProvider for OtcDesk {
    fn dealer_id(&self) -> &ParticipantId {
        self.keys.participant_id()
    }

    async fn process_rfq(&self, rfq: &Rfq) -> RfqResponse {
        self.quote(rfq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualClock;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn pair() -> AssetPair {
        AssetPair::new(AssetId::from_label("L-BTC"), AssetId::from_label("USDT"))
    }

    fn desk(name: &str, spread_bps: u32, clock: Arc<ManualClock>) -> OtcDesk {
        let params = DeskParams {
            spread_bps,
            quote_ttl_secs: 60,
            pairs: [pair()].into_iter().collect(),
            inventory: [(pair().base, 5_000), (pair().quote, 1_000_000)]
                .into_iter()
                .collect(),
        };
        OtcDesk::new(
            ParticipantKeyset::from_seed(ParticipantId::new(name), b"desk"),
            params,
            clock,
        )
    }

    fn client() -> ParticipantKeyset {
        ParticipantKeyset::from_seed(ParticipantId::new("client"), b"client")
    }

    #[tokio::test]
    async fn test_buy_and_sell_pricing() {
        let clock = Arc::new(ManualClock::new(1_000));
        let desk_a = desk("desk-a", 10, clock.clone());
        let desk_b = desk("desk-b", 25, clock.clone());

        let rfq = Rfq::new(&client(), pair(), Side::Buy, 1000, dec("100.00"), 1_300, 1_000).unwrap();

        let RfqResponse::Quote(a) = desk_a.process_rfq(&rfq).await else {
            panic!("desk-a should quote");
        };
        let RfqResponse::Quote(b) = desk_b.process_rfq(&rfq).await else {
            panic!("desk-b should quote");
        };
        assert_eq!(a.price(), dec("100.10"));
        assert_eq!(b.price(), dec("100.25"));
        assert_eq!(a.size(), 1000);
        assert_eq!(a.expiry(), 1_060);

        let sell = Rfq::new(&client(), pair(), Side::Sell, 1000, dec("100.00"), 1_300, 1_000).unwrap();
        let RfqResponse::Quote(s) = desk_a.process_rfq(&sell).await else {
            panic!("desk-a should quote sell");
        };
        assert_eq!(s.price(), dec("99.90"));
    }

    #[tokio::test]
    async fn test_extreme_reference_price_is_declined() {
        let clock = Arc::new(ManualClock::new(1_000));
        let desk = desk("desk-a", 10, clock);

        // reference_price * (1 + spread) overflows the decimal range
        let huge = Rfq::new(&client(), pair(), Side::Buy, 10, Decimal::MAX, 1_300, 1_000).unwrap();
        assert!(desk.price_for(Side::Buy, Decimal::MAX).is_err());
        assert!(matches!(
            desk.process_rfq(&huge).await,
            RfqResponse::Declined {
                reason: DeclineReason::PriceOutOfRange,
                ..
            }
        ));

        // Price fits, but the payment does not fit a u64 amount
        let notional = Rfq::new(&client(), pair(), Side::Sell, u64::MAX, dec("100"), 1_300, 1_000).unwrap();
        assert!(matches!(
            desk.process_rfq(&notional).await,
            RfqResponse::Declined {
                reason: DeclineReason::PriceOutOfRange,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_full_spread_never_quotes_non_positive_price() {
        let clock = Arc::new(ManualClock::new(1_000));
        assert!(matches!(
            DeskParams::new(10_000, 60, HashSet::new(), HashMap::new()),
            Err(SettlementError::Configuration(_))
        ));
        assert!(DeskParams::new(9_999, 60, HashSet::new(), HashMap::new()).is_ok());

        // Bypassing the constructor still cannot produce a zero-price quote
        let desk = desk("desk-z", 10_000, clock);
        let sell = Rfq::new(&client(), pair(), Side::Sell, 10, dec("100"), 1_300, 1_000).unwrap();
        assert!(matches!(
            desk.process_rfq(&sell).await,
            RfqResponse::Declined {
                reason: DeclineReason::PriceOutOfRange,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_quote_signature_verifies_under_desk_key() {
        let clock = Arc::new(ManualClock::new(1_000));
        let desk = desk("desk-a", 10, clock);
        let rfq = Rfq::new(&client(), pair(), Side::Buy, 10, dec("50"), 1_030, 1_000).unwrap();

        let RfqResponse::Quote(quote) = desk.process_rfq(&rfq).await else {
            panic!("should quote");
        };
        // Quote never outlives the RFQ
        assert_eq!(quote.expiry(), 1_030);
        assert!(desk
            .keys()
            .identity_pubkey()
            .verify(&quote.signing_payload().unwrap(), quote.signature()));
    }

    #[tokio::test]
    async fn test_declines() {
        let clock = Arc::new(ManualClock::new(1_000));
        let desk = desk("desk-a", 10, clock.clone());

        let other = AssetPair::new(AssetId::from_label("EUR"), AssetId::from_label("USDT"));
        let rfq = Rfq::new(&client(), other, Side::Buy, 10, dec("1"), 1_300, 1_000).unwrap();
        assert!(matches!(
            desk.process_rfq(&rfq).await,
            RfqResponse::Declined {
                reason: DeclineReason::UnsupportedPair,
                ..
            }
        ));

        let big = Rfq::new(&client(), pair(), Side::Buy, 5_001, dec("100"), 1_300, 1_000).unwrap();
        assert!(matches!(
            desk.process_rfq(&big).await,
            RfqResponse::Declined {
                reason: DeclineReason::InsufficientInventory,
                ..
            }
        ));

        // Sell leg is paid in the quote asset: 20_000 * 99.9 > 1_000_000
        let big_sell =
            Rfq::new(&client(), pair(), Side::Sell, 20_000, dec("100"), 1_300, 1_000).unwrap();
        assert!(matches!(
            desk.process_rfq(&big_sell).await,
            RfqResponse::Declined {
                reason: DeclineReason::InsufficientInventory,
                ..
            }
        ));

        let rfq = Rfq::new(&client(), pair(), Side::Buy, 10, dec("100"), 1_300, 1_000).unwrap();
        clock.set(1_300);
        assert!(matches!(
            desk.process_rfq(&rfq).await,
            RfqResponse::Declined {
                reason: DeclineReason::Expired,
                ..
            }
        ));
    }
}
