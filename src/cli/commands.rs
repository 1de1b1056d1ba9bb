//! CLI command definitions

use crate::types::Side;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "crfq")]
#[command(about = "Confidential RFQ - request-for-quote trading with atomic confidential settlement", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults apply when absent)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an RFQ and settle the best quote on an in-memory regtest ledger
    Demo {
        /// Trade size in base-asset units
        #[arg(short, long, default_value = "1000")]
        size: u64,

        /// Reference price (quote units per base unit)
        #[arg(short = 'p', long, default_value = "100.00")]
        reference_price: Decimal,

        /// Client side
        #[arg(long, value_enum, default_value = "buy")]
        side: SideArg,

        /// Override the reclaim timelock in blocks
        #[arg(long)]
        csv_delay: Option<u32>,

        /// Blocks to mine after settlement before attempting a reclaim
        #[arg(long, default_value = "6")]
        reclaim_after: u32,
    },

    /// Derive the joint timelocked descriptor and address for two payment keys
    Descriptor {
        /// Client payment public key (hex)
        #[arg(long)]
        client: String,

        /// Dealer payment public key (hex)
        #[arg(long)]
        dealer: String,

        /// Reclaim timelock in blocks
        #[arg(long, default_value = "150")]
        csv_delay: u32,
    },

    /// Derive a participant keyset from a seed
    Keygen {
        /// Participant id
        participant_id: String,

        /// Seed phrase
        #[arg(short, long)]
        seed: String,
    },

    /// Write a default configuration file
    ConfigInit {
        /// Output path
        #[arg(default_value = "crfq.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => Side::Buy,
            SideArg::Sell => Side::Sell,
        }
    }
}
