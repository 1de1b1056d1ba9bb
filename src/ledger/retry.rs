//! Timeouts and bounded retries around ledger calls

use crate::descriptor::{JointDescriptor, LockingScript};
use crate::error::LedgerError;
use crate::settlement::SettlementTransaction;
use crate::types::Txid;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{LedgerEngine, TxStatus, Utxo};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following `delay_ms`
    pub fn next_delay(&self, delay_ms: u64) -> u64 {
        ((delay_ms as f64 * self.backoff_multiplier) as u64).min(self.max_delay_ms)
    }
}

/// Run `call` under `timeout`, mapping expiry to [`LedgerError::Timeout`]
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| LedgerError::Timeout {
            operation: operation.to_string(),
            after_ms: timeout.as_millis() as u64,
        })?
}

/// Retry an idempotent call while it fails ambiguously
pub async fn retry_idempotent<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    timeout: Duration,
    mut call: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut delay_ms = config.initial_delay_ms;
    let mut attempt = 1;
    loop {
        match with_timeout(operation, timeout, call()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_ambiguous() && attempt < config.max_attempts => {
                warn!(operation, attempt, delay_ms, error = %e, "Ledger call failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = config.next_delay(delay_ms);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Ledger handle applying per-call timeouts and read retries
#[derive(Clone)]
pub struct GuardedLedger {
    inner: Arc<dyn LedgerEngine>,
    call_timeout: Duration,
    retry: RetryConfig,
}

impl GuardedLedger {
    pub fn new(inner: Arc<dyn LedgerEngine>, call_timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            inner,
            call_timeout,
            retry,
        }
    }

    pub fn inner(&self) -> &Arc<dyn LedgerEngine> {
        &self.inner
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub async fn tip_height(&self) -> Result<u32, LedgerError> {
        retry_idempotent("tip_height", &self.retry, self.call_timeout, || {
            self.inner.tip_height()
        })
        .await
    }

    pub async fn list_unspent(&self, script: &LockingScript) -> Result<Vec<Utxo>, LedgerError> {
        retry_idempotent("list_unspent", &self.retry, self.call_timeout, || {
            self.inner.list_unspent(script)
        })
        .await
    }

    pub async fn import_descriptor(&self, descriptor: &JointDescriptor) -> Result<(), LedgerError> {
        retry_idempotent("import_descriptor", &self.retry, self.call_timeout, || {
            self.inner.import_descriptor(descriptor)
        })
        .await
    }

    pub async fn transaction_status(&self, txid: &Txid) -> Result<TxStatus, LedgerError> {
        retry_idempotent("transaction_status", &self.retry, self.call_timeout, || {
            self.inner.transaction_status(txid)
        })
        .await
    }

    /// Single submission under timeout; never retried here
    pub async fn broadcast(&self, tx: &SettlementTransaction) -> Result<Txid, LedgerError> {
        with_timeout("broadcast", self.call_timeout, self.inner.broadcast(tx)).await
    }
}
