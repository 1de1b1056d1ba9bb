//! Atomic settlement of an accepted quote
//!
//! The client's leg is locked in a joint output (co-sign, or client reclaim
//! after a relative timelock), then a single confidential transaction swaps
//! it against the dealer's inputs.

pub mod builder;
pub mod coordinator;
pub mod reservation;
pub mod signing;
pub mod types;
pub mod wallet;

pub use builder::{build_blinded_transaction, InputSpec, OutputSpec};
pub use coordinator::{
    DerivedSettlement, FundedSettlement, PendingReclaim, PendingSettlement, SelectedQuote,
    SettlementConfig, SettlementCoordinator,
};
pub use reservation::{ReservationGuard, UtxoReservations};
pub use signing::{finalize_transaction, sign_transaction, verify_input_witness};
pub use types::{
    BlindedOutput, InputPlan, PartialSignature, SettlementStatus, SettlementTransaction, TxInput,
    Witness, SEQUENCE_FINAL,
};
pub use wallet::OwnedCoin;
