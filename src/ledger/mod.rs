//! The subaccount ledger.
//!
//! - `pipeline`: batch validation and atomic persistence of updates
//! - `isolated`: isolated-market constraints and collateral pools
//! - `rebalancer`: segregated per-position collateral
//! - `open_interest`: open-interest change of a matched trade
//! - `safety_heap`: persistent per-(market, side) risk ranking
//! - `negative_tnc`: withdrawal and transfer gating
//! - `transfer`: deposits, withdrawals, fees and other pool movements

pub mod isolated;
pub mod negative_tnc;
pub mod open_interest;
mod pipeline;
pub mod rebalancer;
pub mod safety_heap;
mod transfer;

use serde::Serialize;

use crate::config::LedgerConfig;
use crate::external::{BankKeeper, EventSink, MarketRegistry};
use crate::store::{keys, read_record, write_record, KvStore};
use crate::types::{Address, LedgerResult, Subaccount, SubaccountId, UpdateResult};

pub use negative_tnc::{
    get_negative_tnc_seen_at, mark_negative_tnc_subaccounts, set_negative_tnc_seen_at,
    WithdrawalGate,
};
pub use open_interest::{OpenInterestBranch, OpenInterestDelta};
pub use rebalancer::RebalanceReport;
pub use safety_heap::SafetyHeap;
pub use transfer::{FillFees, RevenueShare};

/// Chain state a batch is evaluated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockContext {
    pub height: u32,
    /// Block at which the last chain outage was observed, if any.
    pub chain_outage_seen_at: Option<u32>,
}

impl BlockContext {
    pub fn at(height: u32) -> Self {
        Self {
            height,
            chain_outage_seen_at: None,
        }
    }
}

/// Outcome of a batch: overall success plus one result per update, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub results: Vec<UpdateResult>,
    #[serde(skip)]
    pub open_interest_delta: Option<OpenInterestDelta>,
}

impl BatchOutcome {
    fn from_results(results: Vec<UpdateResult>) -> Self {
        Self {
            success: results.iter().all(UpdateResult::is_success),
            results,
            open_interest_delta: None,
        }
    }

    /// Every update gets the same result.
    fn uniform(result: UpdateResult, len: usize) -> Self {
        Self::from_results(vec![result; len])
    }
}

/// Stored subaccount, or an empty one when it was never written.
pub fn get_subaccount<S: KvStore>(store: &S, id: &SubaccountId) -> LedgerResult<Subaccount> {
    Ok(read_record(store, &keys::subaccount(id))?.unwrap_or_else(|| Subaccount::empty(id.clone())))
}

/// Write a subaccount, removing it from state when it holds nothing.
pub fn set_subaccount<S: KvStore>(store: &mut S, subaccount: &Subaccount) -> LedgerResult<()> {
    let key = keys::subaccount(&subaccount.id);
    if subaccount.is_empty() {
        store.delete(&key)?;
        return Ok(());
    }
    write_record(store, &key, subaccount)
}

/// Every stored subaccount, in storage key order.
///
/// Keys are the owner, `/`, then the big-endian number, so an owner that
/// extends another with a byte below `/` sorts ahead of it.
pub fn list_subaccounts<S: KvStore>(store: &S) -> LedgerResult<Vec<Subaccount>> {
    store
        .prefix_scan(keys::SUBACCOUNT_PREFIX)?
        .into_iter()
        .map(|(_, value)| -> LedgerResult<Subaccount> { Ok(serde_json::from_slice(&value)?) })
        .collect()
}

/// Ledger over its external collaborators. Storage is passed to every call.
pub struct Ledger<R, B, E>
where
    R: MarketRegistry,
    B: BankKeeper,
    E: EventSink,
{
    config: LedgerConfig,
    markets: R,
    bank: B,
    events: E,
}

impl<R, B, E> Ledger<R, B, E>
where
    R: MarketRegistry,
    B: BankKeeper,
    E: EventSink,
{
    pub fn new(config: LedgerConfig, markets: R, bank: B, events: E) -> Self {
        Self {
            config,
            markets,
            bank,
            events,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn markets(&self) -> &R {
        &self.markets
    }

    pub fn markets_mut(&mut self) -> &mut R {
        &mut self.markets
    }

    pub fn bank(&self) -> &B {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut B {
        &mut self.bank
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    fn gate(&self) -> WithdrawalGate {
        WithdrawalGate::new(self.config.negative_tnc_block_window)
    }

    /// Record the current block for the pool of every listed account with
    /// negative net collateral.
    pub fn mark_negative_tnc_subaccounts<S: KvStore>(
        &self,
        store: &mut S,
        ctx: &BlockContext,
        ids: &[SubaccountId],
    ) -> LedgerResult<Vec<Address>> {
        mark_negative_tnc_subaccounts(store, &self.markets, ctx, ids)
    }
}
