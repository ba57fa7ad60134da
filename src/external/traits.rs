//! Interfaces of the systems the ledger relies on but does not own.
//!
//! The market registry is the source of truth for prices, indices and margin
//! parameters; the bank moves the real settlement-asset tokens backing the
//! collateral pools; the event sink receives committed subaccount changes.

use num_bigint::BigInt;

use crate::types::{Address, LedgerResult, PerpetualInfo, SubaccountUpdateEvent};

/// Read access to perpetual markets, plus open-interest bookkeeping.
#[cfg_attr(test, mockall::automock)]
pub trait MarketRegistry {
    /// Fails with `PerpetualDoesNotExist` for unknown ids.
    fn get_perpetual(&self, perpetual_id: u32) -> LedgerResult<PerpetualInfo>;

    /// Apply a signed change to a market's open interest.
    fn modify_open_interest(
        &mut self,
        perpetual_id: u32,
        base_quantums_delta: &BigInt,
    ) -> LedgerResult<()>;

    /// Current settlement-asset yield index, as a rational string.
    fn settlement_asset_yield_index(&self) -> String;
}

/// Settlement-asset token balances.
#[cfg_attr(test, mockall::automock)]
pub trait BankKeeper {
    fn balance(&self, address: &Address) -> BigInt;

    /// Move `quantums` from one account to another; fails with `InsufficientFunds`.
    fn send(&mut self, from: &Address, to: &Address, quantums: &BigInt) -> LedgerResult<()>;
}

/// Receiver of committed subaccount changes.
#[cfg_attr(test, mockall::automock)]
pub trait EventSink {
    fn emit(&mut self, event: SubaccountUpdateEvent);
}
