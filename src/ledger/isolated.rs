//! Isolated-market constraints and collateral pool resolution.
//!
//! An account holding a position in an isolated market holds nothing else,
//! and its collateral lives in that market's dedicated pool. Every other
//! account is backed by the shared cross pool.

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use tracing::debug;

use crate::external::MarketRegistry;
use crate::types::{Address, LedgerResult, SettledUpdate, Subaccount, UpdateResult};

/// Verdict for one update against the isolated-market rules.
pub fn check_isolated_update<R>(update: &SettledUpdate, markets: &R) -> LedgerResult<UpdateResult>
where
    R: MarketRegistry + ?Sized,
{
    if update.perpetual_updates.is_empty() {
        return Ok(UpdateResult::Success);
    }

    let mut isolated_update: Option<u32> = None;
    let mut has_cross_update = false;
    for u in &update.perpetual_updates {
        if markets.get_perpetual(u.perpetual_id)?.is_isolated() {
            isolated_update = Some(u.perpetual_id);
        } else {
            has_cross_update = true;
        }
    }

    let mut held_isolated: Option<u32> = None;
    let mut holds_cross = false;
    for p in &update.settled_subaccount.perpetual_positions {
        if markets.get_perpetual(p.perpetual_id)?.is_isolated() {
            held_isolated = Some(p.perpetual_id);
        } else {
            holds_cross = true;
        }
    }

    let violation = match isolated_update {
        Some(id) => {
            update.perpetual_updates.len() > 1
                || holds_cross
                || held_isolated.is_some_and(|held| held != id)
        }
        None => has_cross_update && held_isolated.is_some(),
    };

    if violation {
        debug!(
            subaccount = %update.settled_subaccount.id,
            ?isolated_update,
            ?held_isolated,
            holds_cross,
            "Update violates isolated subaccount constraints"
        );
        Ok(UpdateResult::ViolatesIsolatedSubaccountConstraints)
    } else {
        Ok(UpdateResult::Success)
    }
}

/// Check every update; the batch passes only if all of them do.
pub fn check_isolated_constraints<R>(
    updates: &[SettledUpdate],
    markets: &R,
) -> LedgerResult<(bool, Vec<UpdateResult>)>
where
    R: MarketRegistry + ?Sized,
{
    let results = updates
        .iter()
        .map(|u| check_isolated_update(u, markets))
        .collect::<LedgerResult<Vec<_>>>()?;
    let success = results.iter().all(UpdateResult::is_success);
    Ok((success, results))
}

/// The isolated market an account holds a position in, if any.
pub fn isolated_perpetual_of<R>(subaccount: &Subaccount, markets: &R) -> LedgerResult<Option<u32>>
where
    R: MarketRegistry + ?Sized,
{
    for p in &subaccount.perpetual_positions {
        if markets.get_perpetual(p.perpetual_id)?.is_isolated() {
            return Ok(Some(p.perpetual_id));
        }
    }
    Ok(None)
}

/// Pool holding the tokens backing an account: its first position's market
/// pool, or the cross pool when it holds no position.
pub fn collateral_pool_of<R>(subaccount: &Subaccount, markets: &R) -> LedgerResult<Address>
where
    R: MarketRegistry + ?Sized,
{
    match subaccount.perpetual_positions.first() {
        Some(p) => Ok(markets.get_perpetual(p.perpetual_id)?.collateral_pool()),
        None => Ok(Address::cross_collateral_pool()),
    }
}

/// A move of settlement-asset tokens between two accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTransfer {
    pub from: Address,
    pub to: Address,
    pub quantums: BigInt,
}

impl PoolTransfer {
    /// A move of `quantums` from `from` to `to`; a negative amount moves the
    /// other way and zero moves nothing.
    pub fn signed(from: Address, to: Address, quantums: &BigInt) -> Option<Self> {
        if quantums.is_zero() {
            return None;
        }
        let (from, to) = if quantums.is_negative() {
            (to, from)
        } else {
            (from, to)
        };
        Some(Self {
            from,
            to,
            quantums: quantums.abs(),
        })
    }
}

/// Tokens to move when an update opens or closes an account's isolated position.
///
/// Opening moves the account's whole settlement-asset quantity from the cross
/// pool to the isolated pool; closing moves it back. Nothing moves when the
/// quantity is not positive.
pub fn collateral_pool_transfer<R>(
    before: &Subaccount,
    after: &Subaccount,
    markets: &R,
) -> LedgerResult<Option<PoolTransfer>>
where
    R: MarketRegistry + ?Sized,
{
    let isolated_before = isolated_perpetual_of(before, markets)?;
    let isolated_after = isolated_perpetual_of(after, markets)?;

    let (from, to) = match (isolated_before, isolated_after) {
        (None, Some(id)) => (
            Address::cross_collateral_pool(),
            Address::isolated_collateral_pool(id),
        ),
        (Some(id), None) => (
            Address::isolated_collateral_pool(id),
            Address::cross_collateral_pool(),
        ),
        _ => return Ok(None),
    };

    let quantums = after.total_settlement_quantums();
    if !quantums.is_positive() {
        return Ok(None);
    }
    Ok(Some(PoolTransfer { from, to, quantums }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryMarkets;
    use crate::types::{
        LedgerError, LiquidityTier, MarketType, PerpetualInfo, PerpetualPosition, SubaccountId,
        Update, ZERO_YIELD_INDEX,
    };
    use num_traits::Zero;
    use rust_decimal_macros::dec;

    fn markets() -> InMemoryMarkets {
        let tier = LiquidityTier {
            id: 0,
            name: "Large-Cap".to_string(),
            initial_margin_ppm: 50_000,
            maintenance_fraction_ppm: 600_000,
            ..LiquidityTier::default()
        };
        InMemoryMarkets::new(vec![
            PerpetualInfo::new(0, "BTC-USD", MarketType::Cross, dec!(50000), -10, tier.clone()),
            PerpetualInfo::new(1, "ETH-USD", MarketType::Cross, dec!(3000), -9, tier.clone()),
            PerpetualInfo::new(3, "ISO-USD", MarketType::Isolated, dec!(1), -6, tier.clone()),
            PerpetualInfo::new(4, "ISO2-USD", MarketType::Isolated, dec!(1), -6, tier),
        ])
    }

    fn holding(positions: &[(u32, i64)]) -> Subaccount {
        let mut subaccount = Subaccount::empty(SubaccountId::new("alice", 0));
        for (id, quantums) in positions {
            subaccount.perpetual_positions.push(PerpetualPosition {
                perpetual_id: *id,
                quantums: BigInt::from(*quantums),
                funding_index: BigInt::zero(),
                yield_index: ZERO_YIELD_INDEX.to_string(),
                quote_balance: BigInt::zero(),
            });
        }
        subaccount
    }

    fn settled(subaccount: Subaccount, deltas: &[(u32, i64)]) -> SettledUpdate {
        let mut update = Update::new(subaccount.id.clone());
        for (id, delta) in deltas {
            update = update.with_perpetual(*id, *delta);
        }
        SettledUpdate {
            settled_subaccount: subaccount,
            asset_updates: update.asset_updates,
            perpetual_updates: update.perpetual_updates,
        }
    }

    fn verdict(held: &[(u32, i64)], deltas: &[(u32, i64)]) -> UpdateResult {
        check_isolated_update(&settled(holding(held), deltas), &markets()).unwrap()
    }

    #[test]
    fn test_no_perpetual_deltas_is_valid() {
        assert_eq!(verdict(&[(3, 5)], &[]), UpdateResult::Success);
    }

    #[test]
    fn test_isolated_rules() {
        let violation = UpdateResult::ViolatesIsolatedSubaccountConstraints;

        // Opening or growing a single isolated position.
        assert_eq!(verdict(&[], &[(3, 5)]), UpdateResult::Success);
        assert_eq!(verdict(&[(3, 5)], &[(3, -5)]), UpdateResult::Success);
        // Different isolated market.
        assert_eq!(verdict(&[(4, 5)], &[(3, 5)]), violation);
        // Isolated delta while holding a cross position.
        assert_eq!(verdict(&[(0, 5)], &[(3, 5)]), violation);
        // Cross delta while holding an isolated position.
        assert_eq!(verdict(&[(3, 5)], &[(0, 5)]), violation);
        // Isolated delta alongside another delta.
        assert_eq!(verdict(&[], &[(3, 5), (0, 5)]), violation);
        // Cross deltas on a cross account.
        assert_eq!(verdict(&[(0, 5)], &[(0, 5), (1, -2)]), UpdateResult::Success);
    }

    #[test]
    fn test_unknown_market_is_fatal() {
        assert!(matches!(
            check_isolated_update(&settled(holding(&[]), &[(9, 1)]), &markets()),
            Err(LedgerError::PerpetualDoesNotExist(9))
        ));
    }

    #[test]
    fn test_batch_fails_if_any_update_fails() {
        let (success, results) = check_isolated_constraints(
            &[
                settled(holding(&[]), &[(0, 1)]),
                settled(holding(&[(3, 1)]), &[(1, 1)]),
            ],
            &markets(),
        )
        .unwrap();
        assert!(!success);
        assert_eq!(
            results,
            vec![
                UpdateResult::Success,
                UpdateResult::ViolatesIsolatedSubaccountConstraints
            ]
        );
    }

    #[test]
    fn test_collateral_pool_follows_positions() {
        let markets = markets();
        assert_eq!(
            collateral_pool_of(&holding(&[]), &markets).unwrap(),
            Address::cross_collateral_pool()
        );
        assert_eq!(
            collateral_pool_of(&holding(&[(3, 1)]), &markets).unwrap(),
            Address::isolated_collateral_pool(3)
        );
        assert_eq!(
            collateral_pool_of(&holding(&[(0, 1), (1, 1)]), &markets).unwrap(),
            Address::cross_collateral_pool()
        );
    }

    #[test]
    fn test_pool_transfer_on_open_and_close() {
        let markets = markets();
        let mut before = holding(&[]);
        before.set_settlement_balance(BigInt::from(1_000));
        let mut after = holding(&[(3, 10)]);
        after.set_settlement_balance(BigInt::from(1_000));

        let open = collateral_pool_transfer(&before, &after, &markets)
            .unwrap()
            .unwrap();
        assert_eq!(open.from, Address::cross_collateral_pool());
        assert_eq!(open.to, Address::isolated_collateral_pool(3));
        assert_eq!(open.quantums, BigInt::from(1_000));

        let close = collateral_pool_transfer(&after, &before, &markets)
            .unwrap()
            .unwrap();
        assert_eq!(close.from, Address::isolated_collateral_pool(3));
        assert_eq!(close.to, Address::cross_collateral_pool());

        // Staying isolated moves nothing.
        assert_eq!(collateral_pool_transfer(&after, &after, &markets).unwrap(), None);

        // Nothing to move for a non-positive balance.
        let mut broke = holding(&[(3, 10)]);
        broke.set_settlement_balance(BigInt::from(-5));
        assert_eq!(collateral_pool_transfer(&before, &broke, &markets).unwrap(), None);
    }
}
