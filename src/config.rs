//! Application configuration loaded from TOML

use crate::error::{Result, SettlementError};
use crate::ledger::RetryConfig;
use crate::negotiation::DeskParams;
use crate::settlement::SettlementConfig;
use crate::types::{AssetId, AssetPair};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub settlement: SettlementSection,
    pub negotiation: NegotiationConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub desks: Vec<DeskConfig>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LedgerConfig {
    /// Timeout applied to every ledger call
    pub call_timeout_ms: u64,
    /// Bounded submissions after ambiguous broadcast failures
    pub max_broadcast_attempts: u32,
    /// Mine a block for each accepted transaction (in-memory engine only)
    pub mine_on_accept: bool,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct SettlementSection {
    pub csv_delay: u32,
    pub fee: u64,
    pub fee_asset: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct NegotiationConfig {
    /// Upper bound on quote collection, whatever the RFQ expiry
    pub collection_timeout_ms: u64,
    /// Lifetime given to RFQs created by the demo
    pub rfq_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DeskConfig {
    pub dealer_id: String,
    pub spread_bps: u32,
    pub quote_ttl_secs: u64,
    /// Pairs as `BASE/QUOTE` asset labels
    pub pairs: Vec<String>,
    /// Quotable amount per asset label
    #[serde(default)]
    pub inventory: BTreeMap<String, u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            max_broadcast_attempts: 3,
            mine_on_accept: true,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for SettlementSection {
    fn default() -> Self {
        Self {
            csv_delay: 150,
            fee: 50,
            fee_asset: "L-BTC".to_string(),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            collection_timeout_ms: 2_000,
            rfq_ttl_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("pretty".to_string()),
        }
    }
}

impl DeskConfig {
    fn new(dealer_id: &str, spread_bps: u32) -> Self {
        Self {
            dealer_id: dealer_id.to_string(),
            spread_bps,
            quote_ttl_secs: 60,
            pairs: vec!["L-BTC/USDT".to_string()],
            inventory: BTreeMap::from([
                ("L-BTC".to_string(), 100_000),
                ("USDT".to_string(), 10_000_000),
            ]),
        }
    }

    /// Desks quoted by the demo: 10 bps and 25 bps on L-BTC/USDT
    pub fn demo_desks() -> Vec<Self> {
        vec![Self::new("desk-a", 10), Self::new("desk-b", 25)]
    }

    pub fn params(&self) -> Result<DeskParams> {
        let pairs = self
            .pairs
            .iter()
            .map(|pair| parse_pair(pair))
            .collect::<Result<HashSet<_>>>()?;
        let inventory: HashMap<AssetId, u64> = self
            .inventory
            .iter()
            .map(|(label, amount)| (AssetId::from_label(label), *amount))
            .collect();

        DeskParams::new(self.spread_bps, self.quote_ttl_secs, pairs, inventory)
            .map_err(|e| SettlementError::Configuration(format!("desk {}: {}", self.dealer_id, e)))
    }
}

/// Parse `BASE/QUOTE`
pub fn parse_pair(pair: &str) -> Result<AssetPair> {
    match pair.split_once('/') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() && base != quote => Ok(
            AssetPair::new(AssetId::from_label(base), AssetId::from_label(quote)),
        ),
        _ => Err(SettlementError::Configuration(format!(
            "invalid asset pair {:?}, expected BASE/QUOTE",
            pair
        ))),
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| SettlementError::Configuration(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| SettlementError::Configuration(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `RUST_LOG` and `CRFQ_CSV_DELAY`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }

        if let Ok(csv_delay) = std::env::var("CRFQ_CSV_DELAY") {
            self.settlement.csv_delay = csv_delay.parse().map_err(|_| {
                SettlementError::Configuration(format!("CRFQ_CSV_DELAY is not a block count: {}", csv_delay))
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.settlement.csv_delay == 0 || self.settlement.csv_delay > crate::descriptor::MAX_CSV_DELAY {
            return Err(SettlementError::Configuration(format!(
                "csv_delay must be within 1..={}, got {}",
                crate::descriptor::MAX_CSV_DELAY,
                self.settlement.csv_delay
            )));
        }

        if self.settlement.fee_asset.is_empty() {
            return Err(SettlementError::Configuration("Fee asset cannot be empty".to_string()));
        }

        if self.ledger.call_timeout_ms == 0 {
            return Err(SettlementError::Configuration("Ledger call timeout cannot be 0".to_string()));
        }

        if self.ledger.retry.max_attempts == 0 || self.ledger.max_broadcast_attempts == 0 {
            return Err(SettlementError::Configuration("Attempt limits must be at least 1".to_string()));
        }

        if self.negotiation.collection_timeout_ms == 0 {
            return Err(SettlementError::Configuration("Collection timeout cannot be 0".to_string()));
        }

        let mut seen = HashSet::new();
        for desk in &self.desks {
            if !seen.insert(desk.dealer_id.as_str()) {
                return Err(SettlementError::Configuration(format!(
                    "Duplicate desk id: {}",
                    desk.dealer_id
                )));
            }
            desk.params()?;
        }

        Ok(())
    }

    pub fn settlement_config(&self) -> SettlementConfig {
        SettlementConfig {
            csv_delay: self.settlement.csv_delay,
            fee: self.settlement.fee,
            fee_asset: AssetId::from_label(&self.settlement.fee_asset),
            max_broadcast_attempts: self.ledger.max_broadcast_attempts,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger.call_timeout_ms)
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation.collection_timeout_ms)
    }

    /// Configured desks, or the two demo desks when none are configured
    pub fn desks_or_demo(&self) -> Vec<DeskConfig> {
        if self.desks.is_empty() {
            DeskConfig::demo_desks()
        } else {
            self.desks.clone()
        }
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig {
        desks: DeskConfig::demo_desks(),
        ..AppConfig::default()
    };
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| SettlementError::Configuration(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| SettlementError::Configuration(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
