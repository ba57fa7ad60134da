//! Open-interest change implied by a matched trade.

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use std::collections::BTreeMap;
use tracing::debug;

use crate::external::MarketRegistry;
use crate::types::{LedgerError, LedgerResult, PerpetualInfo, SettledUpdate, UpdateType};
use crate::utils::decimal::positive_part;

/// Signed change of a market's open interest, in base quantums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenInterestDelta {
    pub perpetual_id: u32,
    pub base_quantums: BigInt,
}

/// A match is exactly two updates, each moving one position in the same
/// market by opposite amounts of equal magnitude.
pub fn validate_match_updates(updates: &[SettledUpdate]) -> LedgerResult<()> {
    if updates.len() != 2 {
        return Err(LedgerError::InvalidMatchUpdates(format!(
            "expected 2 updates, got {}",
            updates.len()
        )));
    }
    for u in updates {
        if u.perpetual_updates.len() != 1 {
            return Err(LedgerError::InvalidMatchUpdates(format!(
                "{} has {} perpetual updates, expected 1",
                u.settled_subaccount.id,
                u.perpetual_updates.len()
            )));
        }
    }

    let a = &updates[0].perpetual_updates[0];
    let b = &updates[1].perpetual_updates[0];
    if a.perpetual_id != b.perpetual_id {
        return Err(LedgerError::InvalidMatchUpdates(format!(
            "perpetual ids differ: {} vs {}",
            a.perpetual_id, b.perpetual_id
        )));
    }
    if a.quantums_delta.is_zero() || a.quantums_delta.sign() == b.quantums_delta.sign() {
        return Err(LedgerError::InvalidMatchUpdates(format!(
            "deltas must have opposite signs: {} vs {}",
            a.quantums_delta, b.quantums_delta
        )));
    }
    if a.quantums_delta.abs() != b.quantums_delta.abs() {
        return Err(LedgerError::InvalidMatchUpdates(format!(
            "deltas must have equal magnitude: {} vs {}",
            a.quantums_delta, b.quantums_delta
        )));
    }
    Ok(())
}

/// Change in long exposure summed over both sides of a match.
///
/// `None` for anything other than a match, or when the trade leaves open
/// interest unchanged.
pub fn open_interest_delta(
    updates: &[SettledUpdate],
    update_type: UpdateType,
) -> LedgerResult<Option<OpenInterestDelta>> {
    if update_type != UpdateType::Match {
        return Ok(None);
    }
    validate_match_updates(updates)?;

    let perpetual_id = updates[0].perpetual_updates[0].perpetual_id;
    let mut delta = BigInt::zero();
    for u in updates {
        let before = u
            .settled_subaccount
            .perpetual_position(perpetual_id)
            .map(|p| p.quantums.clone())
            .unwrap_or_default();
        let after = &before + &u.perpetual_updates[0].quantums_delta;
        delta += positive_part(&after) - positive_part(&before);
    }

    if delta.is_zero() {
        return Ok(None);
    }
    Ok(Some(OpenInterestDelta {
        perpetual_id,
        base_quantums: delta,
    }))
}

/// Market view with pending open-interest changes layered on top.
///
/// Margin checks of a match run against the open interest the trade would
/// leave behind; the changes live only as long as the branch.
pub struct OpenInterestBranch<'a, R: ?Sized> {
    parent: &'a R,
    pending: BTreeMap<u32, BigInt>,
}

impl<'a, R: MarketRegistry + ?Sized> OpenInterestBranch<'a, R> {
    pub fn new(parent: &'a R) -> Self {
        Self {
            parent,
            pending: BTreeMap::new(),
        }
    }
}

impl<R: MarketRegistry + ?Sized> MarketRegistry for OpenInterestBranch<'_, R> {
    fn get_perpetual(&self, perpetual_id: u32) -> LedgerResult<PerpetualInfo> {
        let mut perpetual = self.parent.get_perpetual(perpetual_id)?;
        if let Some(delta) = self.pending.get(&perpetual_id) {
            perpetual.open_interest += delta;
        }
        Ok(perpetual)
    }

    fn modify_open_interest(
        &mut self,
        perpetual_id: u32,
        base_quantums_delta: &BigInt,
    ) -> LedgerResult<()> {
        let current = self.get_perpetual(perpetual_id)?.open_interest;
        if (&current + base_quantums_delta).is_negative() {
            return Err(LedgerError::OpenInterest { perpetual_id });
        }
        *self.pending.entry(perpetual_id).or_default() += base_quantums_delta;
        debug!(perpetual_id, delta = %base_quantums_delta, "Open interest branched");
        Ok(())
    }

    fn settlement_asset_yield_index(&self) -> String {
        self.parent.settlement_asset_yield_index()
    }
}
