//! Confidential RFQ
//!
//! Request-for-quote negotiation between a client and competing OTC desks,
//! settled atomically in one confidential transaction. The client's leg is
//! locked in a joint output spendable by both parties together, or by the
//! client alone after a relative timelock.
//!
//! - `negotiation`: signed RFQs and quotes, desk pricing, quote collection
//! - `descriptor`: joint timelocked descriptor and confidential address
//! - `settlement`: funding, blinding, signing, finalization and broadcast
//! - `ledger`: the ledger engine boundary and an in-memory regtest engine

pub mod cli;
pub mod config;
pub mod crypto;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod negotiation;
pub mod settlement;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SettlementError};
pub use negotiation::{NegotiationEngine, OtcDesk, Quote, QuoteProvider, Rfq};
pub use settlement::{SettlementCoordinator, SettlementStatus, SettlementTransaction};
pub use types::{AssetId, AssetPair, ParticipantId, Side};
