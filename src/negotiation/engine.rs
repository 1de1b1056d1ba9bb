//! Negotiation engine fans an RFQ out to every desk and picks the best quote

use crate::error::{QuoteRejection, Result, SettlementError};
use crate::identity::{verify, IdentityRegistry};
use crate::types::{Clock, ParticipantId, RfqId, Side};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::desk::QuoteProvider;
use super::types::{DeclineReason, Quote, Rfq, RfqResponse};

/// Outcome of one collection round
#[derive(Clone, Debug)]
pub struct QuoteRound {
    pub rfq_id: RfqId,
    pub accepted: Vec<Quote>,
    pub declined: Vec<(ParticipantId, DeclineReason)>,
    pub rejected: Vec<(ParticipantId, QuoteRejection)>,
    pub timed_out: Vec<ParticipantId>,
}

impl QuoteRound {
    fn new(rfq_id: RfqId) -> Self {
        Self {
            rfq_id,
            accepted: Vec::new(),
            declined: Vec::new(),
            rejected: Vec::new(),
            timed_out: Vec::new(),
        }
    }

    /// Best accepted quote for the client's side
    pub fn best(&self, side: Side) -> Option<&Quote> {
        select_best(&self.accepted, side)
    }
}

/// Negotiation engine holding every composed quote provider
pub struct NegotiationEngine {
    providers: Vec<Arc<dyn QuoteProvider>>,
    registry: Arc<IdentityRegistry>,
    clock: Arc<dyn Clock>,
    collection_timeout: Duration,
}

impl NegotiationEngine {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        clock: Arc<dyn Clock>,
        collection_timeout: Duration,
    ) -> Self {
        Self {
            providers: Vec::new(),
            registry,
            clock,
            collection_timeout,
        }
    }

    pub fn add_provider(&mut self, provider: Arc<dyn QuoteProvider>) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn QuoteProvider>] {
        &self.providers
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Check the client's signature and that the RFQ is still open
    pub fn verify_rfq(&self, rfq: &Rfq) -> Result<()> {
        verify_rfq_signature(rfq, &self.registry)?;

        let now = self.clock.now();
        if rfq.is_expired(now) {
            return Err(SettlementError::RfqValidation(format!(
                "expired at {} (now {})",
                rfq.expiry(),
                now
            )));
        }
        Ok(())
    }

    /// Fan out to all providers concurrently and collect until the RFQ
    /// expires or the configured timeout elapses, whichever comes first
    pub async fn collect_quotes(&self, rfq: &Rfq) -> Result<QuoteRound> {
        self.verify_rfq(rfq)?;

        let remaining = Duration::from_secs(rfq.expiry().saturating_sub(self.clock.now()));
        let deadline = remaining.min(self.collection_timeout);

        info!(
            rfq = %rfq.id(),
            providers = self.providers.len(),
            deadline_ms = deadline.as_millis() as u64,
            "Broadcasting RFQ"
        );

        let requests = self.providers.iter().map(|provider| async move {
            let dealer = provider.dealer_id().clone();
            let response = tokio::time::timeout(deadline, provider.process_rfq(rfq)).await;
            (dealer, response)
        });
        let responses = join_all(requests).await;

        let now = self.clock.now();
        let mut round = QuoteRound::new(rfq.id());
        for (dealer, response) in responses {
            match response {
                Err(_) => {
                    warn!(dealer = %dealer, rfq = %rfq.id(), "Desk did not answer in time");
                    round.timed_out.push(dealer);
                }
                Ok(RfqResponse::Declined { dealer_id, reason }) => {
                    round.declined.push((dealer_id, reason));
                }
                Ok(RfqResponse::Quote(quote)) => {
                    match verify_quote(rfq, &quote, &self.registry, now) {
                        Ok(()) => round.accepted.push(quote),
                        Err(rejection) => {
                            warn!(
                                dealer = %dealer,
                                rfq = %rfq.id(),
                                reason = %rejection,
                                "Rejected quote"
                            );
                            round.rejected.push((dealer, rejection));
                        }
                    }
                }
            }
        }

        info!(
            rfq = %rfq.id(),
            accepted = round.accepted.len(),
            declined = round.declined.len(),
            rejected = round.rejected.len(),
            timed_out = round.timed_out.len(),
            "Quote collection finished"
        );
        Ok(round)
    }

    /// Collect quotes and return the best one
    pub async fn negotiate(&self, rfq: &Rfq) -> Result<Quote> {
        let round = self.collect_quotes(rfq).await?;
        let best = round
            .best(rfq.side())
            .cloned()
            .ok_or_else(|| SettlementError::NoQuotes(rfq.id().to_string()))?;

        info!(
            rfq = %rfq.id(),
            dealer = %best.dealer_id(),
            price = %best.price(),
            "Selected quote"
        );
        Ok(best)
    }
}

/// Check the RFQ's signature against the client's registered identity
pub fn verify_rfq_signature(rfq: &Rfq, registry: &IdentityRegistry) -> Result<()> {
    let payload = rfq.signing_payload()?;
    if !verify(&payload, rfq.signature(), rfq.client_id(), registry) {
        return Err(SettlementError::RfqValidation(format!(
            "bad client signature from {}",
            rfq.client_id()
        )));
    }
    Ok(())
}

/// Check a quote against the RFQ it claims to answer
pub fn verify_quote(
    rfq: &Rfq,
    quote: &Quote,
    registry: &IdentityRegistry,
    now: u64,
) -> std::result::Result<(), QuoteRejection> {
    if quote.rfq_id() != rfq.id() {
        return Err(QuoteRejection::RfqMismatch);
    }
    if !registry.contains(quote.dealer_id()) {
        return Err(QuoteRejection::UnknownDealer(quote.dealer_id().to_string()));
    }

    let payload = quote
        .signing_payload()
        .map_err(|e| QuoteRejection::Malformed(e.to_string()))?;
    if !verify(&payload, quote.signature(), quote.dealer_id(), registry) {
        return Err(QuoteRejection::BadSignature);
    }

    if quote.size() > rfq.size() {
        return Err(QuoteRejection::Oversized {
            quoted: quote.size(),
            requested: rfq.size(),
        });
    }
    if quote.expiry() > rfq.expiry() {
        return Err(QuoteRejection::OutlivesRfq {
            quote_expiry: quote.expiry(),
            rfq_expiry: rfq.expiry(),
        });
    }
    if now >= quote.expiry() {
        return Err(QuoteRejection::Expired {
            expiry: quote.expiry(),
            now,
        });
    }
    Ok(())
}

/// Lowest price for a client buy, highest for a client sell; ties go to the
/// earliest expiry, then to the dealer id
pub fn select_best(quotes: &[Quote], side: Side) -> Option<&Quote> {
    quotes.iter().min_by(|a, b| {
        let by_price = match side {
            Side::Buy => a.price().cmp(&b.price()),
            Side::Sell => b.price().cmp(&a.price()),
        };
        by_price
            .then_with(|| a.expiry().cmp(&b.expiry()))
            .then_with(|| a.dealer_id().cmp(b.dealer_id()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ParticipantKeyset;
    use crate::negotiation::desk::{DeskParams, OtcDesk};
    use crate::types::{AssetId, AssetPair, ManualClock};
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn pair() -> AssetPair {
        AssetPair::new(AssetId::from_label("L-BTC"), AssetId::from_label("USDT"))
    }

    fn keys(name: &str) -> ParticipantKeyset {
        ParticipantKeyset::from_seed(ParticipantId::new(name), b"engine-test")
    }

    fn desk(name: &str, spread_bps: u32, clock: Arc<ManualClock>) -> Arc<OtcDesk> {
        let params = DeskParams {
            spread_bps,
            quote_ttl_secs: 120,
            pairs: [pair()].into_iter().collect(),
            inventory: [(pair().base, 10_000)].into_iter().collect(),
        };
        Arc::new(OtcDesk::new(keys(name), params, clock))
    }

    /// Answers after a long delay
    struct SlowDesk(ParticipantId);

    #[async_trait]
    impl QuoteProvider for SlowDesk {
        fn dealer_id(&self) -> &ParticipantId {
            &self.0
        }

        async fn process_rfq(&self, _rfq: &Rfq) -> RfqResponse {
            tokio::time::sleep(Duration::from_secs(30)).await;
            RfqResponse::Declined {
                dealer_id: self.0.clone(),
                reason: DeclineReason::Expired,
            }
        }
    }

    /// Claims a registered dealer id but signs with an unregistered key
    struct ImpostorDesk {
        forged: ParticipantKeyset,
    }

    #[async_trait]
    impl QuoteProvider for ImpostorDesk {
        fn dealer_id(&self) -> &ParticipantId {
            self.forged.participant_id()
        }

        async fn process_rfq(&self, rfq: &Rfq) -> RfqResponse {
            match Quote::new(rfq, &self.forged, dec("90"), rfq.size(), rfq.expiry()) {
                Ok(q) => RfqResponse::Quote(q),
                Err(_) => RfqResponse::Declined {
                    dealer_id: self.forged.participant_id().clone(),
                    reason: DeclineReason::Expired,
                },
            }
        }
    }

    fn setup(clock: Arc<ManualClock>) -> (NegotiationEngine, ParticipantKeyset) {
        let client = keys("client");
        let mut registry = IdentityRegistry::new();
        registry.register(client.participant_id().clone(), client.identity_pubkey());
        for name in ["desk-a", "desk-b", "impostor"] {
            let k = keys(name);
            registry.register(k.participant_id().clone(), k.identity_pubkey());
        }

        let engine = NegotiationEngine::new(Arc::new(registry), clock, Duration::from_millis(200));
        (engine, client)
    }

    #[tokio::test]
    async fn test_best_quote_selection() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (mut engine, client) = setup(clock.clone());
        engine.add_provider(desk("desk-a", 10, clock.clone()));
        engine.add_provider(desk("desk-b", 25, clock.clone()));

        let rfq = Rfq::new(&client, pair(), Side::Buy, 1000, dec("100.00"), 1_300, 1_000).unwrap();
        let round = engine.collect_quotes(&rfq).await.unwrap();
        assert_eq!(round.accepted.len(), 2);

        let best = engine.negotiate(&rfq).await.unwrap();
        assert_eq!(best.dealer_id(), &ParticipantId::new("desk-a"));
        assert_eq!(best.price(), dec("100.10"));

        let sell = Rfq::new(&client, pair(), Side::Sell, 1000, dec("100.00"), 1_300, 1_000).unwrap();
        let round = engine.collect_quotes(&sell).await.unwrap();
        // desk inventory has no quote asset, so both decline a client sell
        assert_eq!(round.declined.len(), 2);
        assert!(matches!(
            engine.negotiate(&sell).await,
            Err(SettlementError::NoQuotes(_))
        ));
    }

    #[tokio::test]
    async fn test_timeouts_and_forgeries_are_classified() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (mut engine, client) = setup(clock.clone());
        engine.add_provider(desk("desk-a", 10, clock.clone()));
        engine.add_provider(Arc::new(SlowDesk(ParticipantId::new("desk-b"))));
        engine.add_provider(Arc::new(ImpostorDesk {
            forged: ParticipantKeyset::from_seed(ParticipantId::new("impostor"), b"forged"),
        }));

        let rfq = Rfq::new(&client, pair(), Side::Buy, 1000, dec("100.00"), 1_300, 1_000).unwrap();
        let round = engine.collect_quotes(&rfq).await.unwrap();

        assert_eq!(round.accepted.len(), 1);
        assert_eq!(round.timed_out, vec![ParticipantId::new("desk-b")]);
        assert_eq!(
            round.rejected,
            vec![(ParticipantId::new("impostor"), QuoteRejection::BadSignature)]
        );
        // The forged quote is cheaper but never selected
        assert_eq!(round.best(Side::Buy).unwrap().dealer_id(), &ParticipantId::new("desk-a"));
    }

    #[tokio::test]
    async fn test_rfq_rejected_before_fan_out() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (engine, _) = setup(clock.clone());

        let stranger = keys("stranger");
        let rfq = Rfq::new(&stranger, pair(), Side::Buy, 10, dec("100"), 1_300, 1_000).unwrap();
        assert!(matches!(
            engine.collect_quotes(&rfq).await,
            Err(SettlementError::RfqValidation(_))
        ));

        let client = keys("client");
        let rfq = Rfq::new(&client, pair(), Side::Buy, 10, dec("100"), 1_300, 1_000).unwrap();
        clock.set(1_300);
        assert!(matches!(
            engine.collect_quotes(&rfq).await,
            Err(SettlementError::RfqValidation(_))
        ));
    }

    #[test]
    fn test_verify_quote_rules() {
        let client = keys("client");
        let dealer = keys("desk-a");
        let mut registry = IdentityRegistry::new();
        registry.register(dealer.participant_id().clone(), dealer.identity_pubkey());

        let rfq = Rfq::new(&client, pair(), Side::Buy, 1000, dec("100"), 1_300, 1_000).unwrap();
        let other = Rfq::new(&client, pair(), Side::Buy, 1000, dec("100"), 1_300, 1_000).unwrap();
        let quote = Quote::new(&rfq, &dealer, dec("100.1"), 1000, 1_100).unwrap();

        assert_eq!(verify_quote(&rfq, &quote, &registry, 1_000), Ok(()));
        assert_eq!(
            verify_quote(&other, &quote, &registry, 1_000),
            Err(QuoteRejection::RfqMismatch)
        );
        assert_eq!(
            verify_quote(&rfq, &quote, &registry, 1_100),
            Err(QuoteRejection::Expired {
                expiry: 1_100,
                now: 1_100
            })
        );
        assert!(matches!(
            verify_quote(&rfq, &quote, &IdentityRegistry::new(), 1_000),
            Err(QuoteRejection::UnknownDealer(_))
        ));
    }

    #[test]
    fn test_select_best_tie_breaks() {
        let client = keys("client");
        let rfq = Rfq::new(&client, pair(), Side::Buy, 1000, dec("100"), 1_300, 1_000).unwrap();

        let late = Quote::new(&rfq, &keys("desk-a"), dec("100.1"), 1000, 1_200).unwrap();
        let early = Quote::new(&rfq, &keys("desk-c"), dec("100.1"), 1000, 1_100).unwrap();
        let same_b = Quote::new(&rfq, &keys("desk-b"), dec("100.1"), 1000, 1_100).unwrap();
        let dear = Quote::new(&rfq, &keys("desk-d"), dec("101"), 1000, 1_050).unwrap();

        let quotes = vec![late, early, same_b.clone(), dear.clone()];
        assert_eq!(select_best(&quotes, Side::Buy), Some(&same_b));
        assert_eq!(select_best(&quotes, Side::Sell), Some(&dear));
        assert_eq!(select_best(&[], Side::Buy), None);
    }
}
