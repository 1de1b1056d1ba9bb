//! Exclusive reservation of nominated inputs

use crate::error::{Result, SettlementError};
use crate::types::OutPoint;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Outpoints currently held by in-flight settlement attempts
#[derive(Clone, Debug, Default)]
pub struct UtxoReservations {
    reserved: Arc<Mutex<HashSet<OutPoint>>>,
}

impl UtxoReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve all of `outpoints` or none of them
    pub fn reserve(&self, outpoints: &[OutPoint]) -> Result<ReservationGuard> {
        let mut reserved = self.reserved.lock();
        if let Some(taken) = outpoints.iter().find(|op| reserved.contains(op)) {
            return Err(SettlementError::InputReserved(*taken));
        }

        let mut held = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            if reserved.insert(*outpoint) {
                held.push(*outpoint);
            }
        }
        debug!(count = held.len(), "Reserved inputs");

        Ok(ReservationGuard {
            reserved: Arc::clone(&self.reserved),
            held,
        })
    }

    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.reserved.lock().contains(outpoint)
    }

    pub fn len(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.lock().is_empty()
    }
}

/// Held reservation; released when dropped
#[derive(Debug)]
pub struct ReservationGuard {
    reserved: Arc<Mutex<HashSet<OutPoint>>>,
    held: Vec<OutPoint>,
}

impl ReservationGuard {
    pub fn outpoints(&self) -> &[OutPoint] {
        &self.held
    }

    /// Add `outpoints` to this reservation, all or none
    pub fn extend(&mut self, outpoints: &[OutPoint]) -> Result<()> {
        let mut reserved = self.reserved.lock();
        if let Some(taken) = outpoints
            .iter()
            .find(|op| reserved.contains(op) && !self.held.contains(op))
        {
            return Err(SettlementError::InputReserved(*taken));
        }
        for outpoint in outpoints {
            if reserved.insert(*outpoint) {
                self.held.push(*outpoint);
            }
        }
        Ok(())
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock();
        for outpoint in &self.held {
            reserved.remove(outpoint);
        }
    }
}
