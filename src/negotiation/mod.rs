//! Quote negotiation: RFQ fan-out, desk pricing, quote verification and selection

pub mod desk;
pub mod engine;
pub mod types;

pub use desk::{DeskParams, OtcDesk, QuoteProvider};
pub use engine::{select_best, verify_quote, verify_rfq_signature, NegotiationEngine, QuoteRound};
pub use types::{payment_for, DeclineReason, Leg, Quote, Rfq, RfqResponse, TradeLegs};
