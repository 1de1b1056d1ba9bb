//! RFQ and quote value types
//!
//! Both types are immutable once built. Constructors and deserializers enforce
//! the structural invariants; signatures are checked against the identity
//! registry by the negotiation engine.

use crate::error::{QuoteRejection, Result, SettlementError};
use crate::identity::{canonical_payload, IdentitySignature, ParticipantKeyset};
use crate::types::{AssetId, AssetPair, Hash, ParticipantId, RfqId, Side};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

const RFQ_DOMAIN: &str = "crfq/rfq/v1";
const QUOTE_DOMAIN: &str = "crfq/quote/v1";

/// Signed fields of an RFQ, in wire order
#[derive(Serialize)]
struct RfqBody<'a> {
    client_id: &'a ParticipantId,
    asset_pair: &'a AssetPair,
    side: Side,
    size: u64,
    reference_price: &'a Decimal,
    expiry: u64,
    nonce: u64,
}

/// Request for quote, created and signed by the client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RfqWire")]
pub struct Rfq {
    id: RfqId,
    client_id: ParticipantId,
    asset_pair: AssetPair,
    side: Side,
    size: u64,
    reference_price: Decimal,
    expiry: u64,
    nonce: u64,
    signature: IdentitySignature,
}

#[derive(Deserialize)]
struct RfqWire {
    id: RfqId,
    client_id: ParticipantId,
    asset_pair: AssetPair,
    side: Side,
    size: u64,
    reference_price: Decimal,
    expiry: u64,
    nonce: u64,
    signature: IdentitySignature,
}

impl Rfq {
    /// Build and sign a new RFQ with a fresh nonce
    pub fn new(
        client: &ParticipantKeyset,
        asset_pair: AssetPair,
        side: Side,
        size: u64,
        reference_price: Decimal,
        expiry: u64,
        now: u64,
    ) -> Result<Self> {
        if expiry <= now {
            return Err(SettlementError::RfqValidation(format!(
                "expiry {} is not in the future (now {})",
                expiry, now
            )));
        }
        let nonce = rand::thread_rng().gen();
        Self::with_nonce(client, asset_pair, side, size, reference_price, expiry, nonce)
    }

    /// Build and sign an RFQ with an explicit nonce
    pub fn with_nonce(
        client: &ParticipantKeyset,
        asset_pair: AssetPair,
        side: Side,
        size: u64,
        reference_price: Decimal,
        expiry: u64,
        nonce: u64,
    ) -> Result<Self> {
        validate_rfq_fields(&asset_pair, size, &reference_price)?;

        let mut rfq = Rfq {
            id: RfqId(Hash([0u8; 32])),
            client_id: client.participant_id().clone(),
            asset_pair,
            side,
            size,
            reference_price,
            expiry,
            nonce,
            signature: IdentitySignature([0u8; 64]),
        };
        let payload = rfq.signing_payload()?;
        rfq.id = RfqId(Hash::tagged(b"crfq/rfq-id/v1", &[&payload]));
        rfq.signature = client.identity().sign(&payload);
        Ok(rfq)
    }

    /// Canonical bytes covered by the client's signature and the id
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        canonical_payload(
            RFQ_DOMAIN,
            &RfqBody {
                client_id: &self.client_id,
                asset_pair: &self.asset_pair,
                side: self.side,
                size: self.size,
                reference_price: &self.reference_price,
                expiry: self.expiry,
                nonce: self.nonce,
            },
        )
    }

    pub fn id(&self) -> RfqId {
        self.id
    }

    pub fn client_id(&self) -> &ParticipantId {
        &self.client_id
    }

    pub fn asset_pair(&self) -> AssetPair {
        self.asset_pair
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn reference_price(&self) -> Decimal {
        self.reference_price
    }

    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn signature(&self) -> &IdentitySignature {
        &self.signature
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiry
    }
}

fn validate_rfq_fields(asset_pair: &AssetPair, size: u64, reference_price: &Decimal) -> Result<()> {
    if size == 0 {
        return Err(SettlementError::RfqValidation("size must be positive".to_string()));
    }
    if reference_price.is_sign_negative() || reference_price.is_zero() {
        return Err(SettlementError::RfqValidation(format!(
            "reference price must be positive, got {}",
            reference_price
        )));
    }
    if asset_pair.base == asset_pair.quote {
        return Err(SettlementError::RfqValidation(
            "base and quote asset are identical".to_string(),
        ));
    }
    Ok(())
}

impl TryFrom<RfqWire> for Rfq {
    type Error = SettlementError;

    fn try_from(wire: RfqWire) -> Result<Self> {
        validate_rfq_fields(&wire.asset_pair, wire.size, &wire.reference_price)?;

        let rfq = Rfq {
            id: wire.id,
            client_id: wire.client_id,
            asset_pair: wire.asset_pair,
            side: wire.side,
            size: wire.size,
            reference_price: wire.reference_price,
            expiry: wire.expiry,
            nonce: wire.nonce,
            signature: wire.signature,
        };
        let expected = RfqId(Hash::tagged(b"crfq/rfq-id/v1", &[&rfq.signing_payload()?]));
        if rfq.id != expected {
            return Err(SettlementError::RfqValidation(
                "id does not match payload".to_string(),
            ));
        }
        Ok(rfq)
    }
}

/// Signed fields of a quote, in wire order
#[derive(Serialize)]
struct QuoteBody<'a> {
    rfq_id: &'a RfqId,
    dealer_id: &'a ParticipantId,
    price: &'a Decimal,
    size: u64,
    expiry: u64,
    nonce: u64,
}

/// Priced, signed answer of one dealer to one RFQ
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuoteWire")]
pub struct Quote {
    rfq_id: RfqId,
    dealer_id: ParticipantId,
    price: Decimal,
    size: u64,
    expiry: u64,
    nonce: u64,
    signature: IdentitySignature,
}

#[derive(Deserialize)]
struct QuoteWire {
    rfq_id: RfqId,
    dealer_id: ParticipantId,
    price: Decimal,
    size: u64,
    expiry: u64,
    nonce: u64,
    signature: IdentitySignature,
}

impl Quote {
    /// Build and sign a quote answering `rfq`
    pub fn new(
        rfq: &Rfq,
        dealer: &ParticipantKeyset,
        price: Decimal,
        size: u64,
        expiry: u64,
    ) -> std::result::Result<Self, QuoteRejection> {
        validate_quote_fields(&price, size)?;
        if size > rfq.size() {
            return Err(QuoteRejection::Oversized {
                quoted: size,
                requested: rfq.size(),
            });
        }
        if expiry > rfq.expiry() {
            return Err(QuoteRejection::OutlivesRfq {
                quote_expiry: expiry,
                rfq_expiry: rfq.expiry(),
            });
        }

        let mut quote = Quote {
            rfq_id: rfq.id(),
            dealer_id: dealer.participant_id().clone(),
            price,
            size,
            expiry,
            nonce: rand::thread_rng().gen(),
            signature: IdentitySignature([0u8; 64]),
        };
        let payload = quote
            .signing_payload()
            .map_err(|e| QuoteRejection::Malformed(e.to_string()))?;
        quote.signature = dealer.identity().sign(&payload);
        Ok(quote)
    }

    /// Canonical bytes covered by the dealer's signature
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        canonical_payload(
            QUOTE_DOMAIN,
            &QuoteBody {
                rfq_id: &self.rfq_id,
                dealer_id: &self.dealer_id,
                price: &self.price,
                size: self.size,
                expiry: self.expiry,
                nonce: self.nonce,
            },
        )
    }

    pub fn rfq_id(&self) -> RfqId {
        self.rfq_id
    }

    pub fn dealer_id(&self) -> &ParticipantId {
        &self.dealer_id
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn signature(&self) -> &IdentitySignature {
        &self.signature
    }

    /// Quote-asset amount for the quoted size, rounded half away from zero
    pub fn payment_amount(&self) -> Result<u64> {
        payment_for(self.size, self.price)
    }

    /// Amount each side delivers when this quote settles
    pub fn legs(&self, rfq: &Rfq) -> Result<TradeLegs> {
        let pair = rfq.asset_pair();
        let payment = self.payment_amount()?;
        let (client_gives, dealer_gives) = match rfq.side() {
            Side::Buy => (Leg::new(pair.quote, payment), Leg::new(pair.base, self.size)),
            Side::Sell => (Leg::new(pair.base, self.size), Leg::new(pair.quote, payment)),
        };
        Ok(TradeLegs {
            client_gives,
            dealer_gives,
        })
    }
}

fn validate_quote_fields(price: &Decimal, size: u64) -> std::result::Result<(), QuoteRejection> {
    if size == 0 {
        return Err(QuoteRejection::Malformed("size must be positive".to_string()));
    }
    if price.is_sign_negative() || price.is_zero() {
        return Err(QuoteRejection::Malformed(format!(
            "price must be positive, got {}",
            price
        )));
    }
    Ok(())
}

impl TryFrom<QuoteWire> for Quote {
    type Error = QuoteRejection;

    fn try_from(wire: QuoteWire) -> std::result::Result<Self, Self::Error> {
        validate_quote_fields(&wire.price, wire.size)?;
        Ok(Quote {
            rfq_id: wire.rfq_id,
            dealer_id: wire.dealer_id,
            price: wire.price,
            size: wire.size,
            expiry: wire.expiry,
            nonce: wire.nonce,
            signature: wire.signature,
        })
    }
}

/// Convert `size` base units at `price` into quote-asset units
pub fn payment_for(size: u64, price: Decimal) -> Result<u64> {
    Decimal::from(size)
        .checked_mul(price)
        .map(|notional| notional.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|notional| notional.to_u64())
        .ok_or_else(|| {
            SettlementError::RfqValidation(format!("payment for {} @ {} out of range", size, price))
        })
}

/// One side's delivery obligation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub asset: AssetId,
    pub amount: u64,
}

impl Leg {
    pub fn new(asset: AssetId, amount: u64) -> Self {
        Self { asset, amount }
    }
}

/// Both legs of a trade
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeLegs {
    pub client_gives: Leg,
    pub dealer_gives: Leg,
}

/// Why a desk declined to quote
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    UnsupportedPair,
    InsufficientInventory,
    Expired,
    /// Quoted price or payment is not a positive amount the ledger can carry
    PriceOutOfRange,
    /// The desk could not build a quote satisfying the RFQ's bounds
    UnquotableTerms,
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::UnsupportedPair => write!(f, "unsupported asset pair"),
            DeclineReason::InsufficientInventory => write!(f, "insufficient inventory"),
            DeclineReason::Expired => write!(f, "rfq expired"),
            DeclineReason::PriceOutOfRange => write!(f, "price out of range"),
            DeclineReason::UnquotableTerms => write!(f, "terms cannot be quoted"),
        }
    }
}

/// A desk's answer to an RFQ
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RfqResponse {
    Quote(Quote),
    Declined {
        dealer_id: ParticipantId,
        reason: DeclineReason,
    },
}

impl RfqResponse {
    pub fn dealer_id(&self) -> &ParticipantId {
        match self {
            RfqResponse::Quote(quote) => quote.dealer_id(),
            RfqResponse::Declined { dealer_id, .. } => dealer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn pair() -> AssetPair {
        AssetPair::new(AssetId::from_label("L-BTC"), AssetId::from_label("USDT"))
    }

    fn client() -> ParticipantKeyset {
        ParticipantKeyset::from_seed(ParticipantId::new("client"), b"seed")
    }

    fn dealer() -> ParticipantKeyset {
        ParticipantKeyset::from_seed(ParticipantId::new("desk-a"), b"seed")
    }

    fn rfq() -> Rfq {
        Rfq::new(&client(), pair(), Side::Buy, 1000, dec("100.00"), 1_300, 1_000).unwrap()
    }

    #[test]
    fn test_rfq_validation() {
        let c = client();
        assert!(Rfq::new(&c, pair(), Side::Buy, 0, dec("100"), 1_300, 1_000).is_err());
        assert!(Rfq::new(&c, pair(), Side::Buy, 10, dec("0"), 1_300, 1_000).is_err());
        assert!(Rfq::new(&c, pair(), Side::Buy, 10, dec("-1"), 1_300, 1_000).is_err());
        assert!(Rfq::new(&c, pair(), Side::Buy, 10, dec("100"), 1_000, 1_000).is_err());

        let same = AssetPair::new(pair().base, pair().base);
        assert!(Rfq::new(&c, same, Side::Buy, 10, dec("100"), 1_300, 1_000).is_err());
    }

    #[test]
    fn test_rfq_id_covers_nonce() {
        let c = client();
        let a = Rfq::with_nonce(&c, pair(), Side::Buy, 1000, dec("100"), 1_300, 1).unwrap();
        let b = Rfq::with_nonce(&c, pair(), Side::Buy, 1000, dec("100"), 1_300, 2).unwrap();
        let a2 = Rfq::with_nonce(&c, pair(), Side::Buy, 1000, dec("100"), 1_300, 1).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a2.id());
    }

    #[test]
    fn test_rfq_signature_verifies() {
        let rfq = rfq();
        let payload = rfq.signing_payload().unwrap();
        assert!(payload.starts_with(b"crfq/rfq/v1\n{\"client_id\":\"client\""));
        assert!(client().identity_pubkey().verify(&payload, rfq.signature()));
    }

    #[test]
    fn test_rfq_deserialize_rejects_tampering() {
        let rfq = rfq();
        let json = serde_json::to_string(&rfq).unwrap();
        let back: Rfq = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rfq);
        assert_eq!(back.signing_payload().unwrap(), rfq.signing_payload().unwrap());

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["size"] = serde_json::json!(5000);
        assert!(serde_json::from_value::<Rfq>(value).is_err());

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["size"] = serde_json::json!(0);
        assert!(serde_json::from_value::<Rfq>(value).is_err());
    }

    #[test]
    fn test_quote_invariants() {
        let rfq = rfq();
        let d = dealer();

        assert!(matches!(
            Quote::new(&rfq, &d, dec("100.10"), 1001, 1_200),
            Err(QuoteRejection::Oversized { .. })
        ));
        assert!(matches!(
            Quote::new(&rfq, &d, dec("100.10"), 1000, 1_301),
            Err(QuoteRejection::OutlivesRfq { .. })
        ));
        assert!(matches!(
            Quote::new(&rfq, &d, dec("0"), 1000, 1_200),
            Err(QuoteRejection::Malformed(_))
        ));

        let quote = Quote::new(&rfq, &d, dec("100.10"), 1000, 1_300).unwrap();
        assert_eq!(quote.rfq_id(), rfq.id());
        assert!(d
            .identity_pubkey()
            .verify(&quote.signing_payload().unwrap(), quote.signature()));
    }

    #[test]
    fn test_quote_serde() {
        let quote = Quote::new(&rfq(), &dealer(), dec("100.10"), 1000, 1_200).unwrap();
        let json = serde_json::to_string(&quote).unwrap();
        let back: Quote = serde_json::from_str(&json).unwrap();
        assert_eq!(back, quote);

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["price"] = serde_json::json!("-1");
        assert!(serde_json::from_value::<Quote>(value).is_err());
    }

    #[test]
    fn test_payment_rounding() {
        assert_eq!(payment_for(1000, dec("100.10")).unwrap(), 100_100);
        assert_eq!(payment_for(3, dec("0.5")).unwrap(), 2);
        assert_eq!(payment_for(1, dec("2.4")).unwrap(), 2);
    }

    #[test]
    fn test_payment_overflow_is_an_error() {
        assert!(matches!(
            payment_for(u64::MAX, Decimal::MAX),
            Err(SettlementError::RfqValidation(_))
        ));
        // Representable as a decimal, too large for a u64 amount
        assert!(matches!(
            payment_for(u64::MAX, dec("2")),
            Err(SettlementError::RfqValidation(_))
        ));
    }

    #[test]
    fn test_legs_follow_side() {
        let c = client();
        let d = dealer();

        let buy = rfq();
        let quote = Quote::new(&buy, &d, dec("100.10"), 1000, 1_200).unwrap();
        let legs = quote.legs(&buy).unwrap();
        assert_eq!(legs.client_gives, Leg::new(pair().quote, 100_100));
        assert_eq!(legs.dealer_gives, Leg::new(pair().base, 1000));

        let sell = Rfq::new(&c, pair(), Side::Sell, 1000, dec("100"), 1_300, 1_000).unwrap();
        let quote = Quote::new(&sell, &d, dec("99.90"), 1000, 1_200).unwrap();
        let legs = quote.legs(&sell).unwrap();
        assert_eq!(legs.client_gives, Leg::new(pair().base, 1000));
        assert_eq!(legs.dealer_gives, Leg::new(pair().quote, 99_900));
    }
}
