//! In-memory collaborators for tests, simulation and the operator CLI.

use anyhow::{Context, Result};
use num_bigint::BigInt;
use num_traits::Signed;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::traits::{BankKeeper, EventSink, MarketRegistry};
use crate::types::{
    Address, LedgerError, LedgerResult, PerpetualInfo, SubaccountUpdateEvent, ZERO_YIELD_INDEX,
};

/// Market registry backed by a map.
#[derive(Debug, Clone)]
pub struct InMemoryMarkets {
    perpetuals: BTreeMap<u32, PerpetualInfo>,
    asset_yield_index: String,
}

impl Default for InMemoryMarkets {
    fn default() -> Self {
        Self {
            perpetuals: BTreeMap::new(),
            asset_yield_index: ZERO_YIELD_INDEX.to_string(),
        }
    }
}

impl InMemoryMarkets {
    pub fn new(perpetuals: impl IntoIterator<Item = PerpetualInfo>) -> Self {
        Self {
            perpetuals: perpetuals.into_iter().map(|p| (p.id, p)).collect(),
            ..Self::default()
        }
    }

    /// Load markets from a JSON array of `PerpetualInfo`.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read markets file {:?}", path.as_ref()))?;
        let perpetuals: Vec<PerpetualInfo> =
            serde_json::from_str(&raw).context("Failed to parse markets file")?;
        info!(count = perpetuals.len(), "Loaded perpetual markets");
        Ok(Self::new(perpetuals))
    }

    /// Insert or replace a market.
    pub fn upsert(&mut self, perpetual: PerpetualInfo) {
        self.perpetuals.insert(perpetual.id, perpetual);
    }

    pub fn get_mut(&mut self, perpetual_id: u32) -> Option<&mut PerpetualInfo> {
        self.perpetuals.get_mut(&perpetual_id)
    }

    pub fn set_asset_yield_index(&mut self, index: impl Into<String>) {
        self.asset_yield_index = index.into();
    }

    pub fn perpetuals(&self) -> impl Iterator<Item = &PerpetualInfo> {
        self.perpetuals.values()
    }
}

impl MarketRegistry for InMemoryMarkets {
    fn get_perpetual(&self, perpetual_id: u32) -> LedgerResult<PerpetualInfo> {
        self.perpetuals
            .get(&perpetual_id)
            .cloned()
            .ok_or(LedgerError::PerpetualDoesNotExist(perpetual_id))
    }

    fn modify_open_interest(
        &mut self,
        perpetual_id: u32,
        base_quantums_delta: &BigInt,
    ) -> LedgerResult<()> {
        let perpetual = self
            .perpetuals
            .get_mut(&perpetual_id)
            .ok_or(LedgerError::PerpetualDoesNotExist(perpetual_id))?;
        let updated = &perpetual.open_interest + base_quantums_delta;
        if updated.is_negative() {
            return Err(LedgerError::OpenInterest { perpetual_id });
        }
        debug!(
            perpetual_id,
            delta = %base_quantums_delta,
            open_interest = %updated,
            "Open interest modified"
        );
        perpetual.open_interest = updated;
        Ok(())
    }

    fn settlement_asset_yield_index(&self) -> String {
        self.asset_yield_index.clone()
    }
}

/// Token balances backed by a map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBank {
    balances: BTreeMap<Address, BigInt>,
}

impl InMemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an account out of thin air.
    pub fn mint(&mut self, address: Address, quantums: impl Into<BigInt>) {
        *self.balances.entry(address).or_default() += quantums.into();
    }
}

impl BankKeeper for InMemoryBank {
    fn balance(&self, address: &Address) -> BigInt {
        self.balances.get(address).cloned().unwrap_or_default()
    }

    fn send(&mut self, from: &Address, to: &Address, quantums: &BigInt) -> LedgerResult<()> {
        let balance = self.balance(from);
        if &balance < quantums {
            return Err(LedgerError::InsufficientFunds {
                address: *from,
                balance,
                needed: quantums.clone(),
            });
        }
        *self.balances.entry(*from).or_default() -= quantums;
        *self.balances.entry(*to).or_default() += quantums;
        Ok(())
    }
}

/// Event sink that keeps everything it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    pub events: Vec<SubaccountUpdateEvent>,
}

impl EventSink for RecordingEventSink {
    fn emit(&mut self, event: SubaccountUpdateEvent) {
        self.events.push(event);
    }
}
