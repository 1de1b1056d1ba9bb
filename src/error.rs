//! Error types for RFQ negotiation and confidential settlement

use crate::types::{AssetId, OutPoint, Role};
use thiserror::Error;

/// Main error type for the settlement protocol
#[derive(Error, Debug)]
pub enum SettlementError {
    // Negotiation errors
    #[error("RFQ validation failed: {0}")]
    RfqValidation(String),

    #[error("Quote rejected: {0}")]
    QuoteRejected(#[from] QuoteRejection),

    #[error("No acceptable quote received for {0}")]
    NoQuotes(String),

    // Descriptor errors
    #[error("Address construction failed: {0}")]
    AddressConstruction(#[from] AddressConstructionError),

    // Funding errors
    #[error("Insufficient funds for {party}: asset {asset} required {required}, available {available}")]
    InsufficientFunds {
        party: Role,
        asset: AssetId,
        required: u64,
        available: u64,
    },

    #[error("Amount overflow summing asset {0}")]
    AmountOverflow(AssetId),

    #[error("Input already reserved by another settlement: {0}")]
    InputReserved(OutPoint),

    // Transaction errors
    #[error("Blinding error: {0}")]
    Blinding(String),

    #[error("Signature error on input {input}: {reason}")]
    Signature { input: usize, reason: String },

    #[error("Invalid settlement state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Broadcast rejected: {0}")]
    Broadcast(String),

    #[error("Timelock not mature: {current}/{required} confirmations")]
    TimelockNotMature { current: u32, required: u32 },

    #[error("No unspent funding output for descriptor: {0}")]
    FundingOutputNotFound(String),

    // Ledger engine errors, surfaced unmodified
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // General errors
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

/// Why a quote was not accepted for settlement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuoteRejection {
    #[error("bad signature")]
    BadSignature,

    #[error("expired at {expiry} (now {now})")]
    Expired { expiry: u64, now: u64 },

    #[error("quoted size {quoted} exceeds requested size {requested}")]
    Oversized { quoted: u64, requested: u64 },

    #[error("quote expiry {quote_expiry} is later than RFQ expiry {rfq_expiry}")]
    OutlivesRfq { quote_expiry: u64, rfq_expiry: u64 },

    #[error("quote answers a different RFQ")]
    RfqMismatch,

    #[error("unknown dealer identity: {0}")]
    UnknownDealer(String),

    #[error("malformed quote: {0}")]
    Malformed(String),
}

/// Invariant violations when deriving a joint descriptor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressConstructionError {
    #[error("client and dealer payment keys are identical")]
    DuplicateKey,

    #[error("invalid relative timelock {0}: must be within 1..=65535 blocks")]
    InvalidDelay(u32),

    #[error("invalid payment public key: {0}")]
    InvalidKey(String),
}

/// Errors reported by the ledger engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger engine unavailable: {0}")]
    Unavailable(String),

    #[error("Ledger call {operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Consensus or policy rejection, reason passed through verbatim
    #[error("{0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl LedgerError {
    /// Whether the outcome of the call is unknown (the request may have been applied)
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_) | LedgerError::Timeout { .. })
    }
}

impl From<toml::de::Error> for SettlementError {
    fn from(err: toml::de::Error) -> Self {
        SettlementError::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for SettlementError {
    fn from(err: toml::ser::Error) -> Self {
        SettlementError::Configuration(err.to_string())
    }
}

/// Result type alias for settlement operations
pub type Result<T> = std::result::Result<T, SettlementError>;
