//! Funding and yield settlement.
//!
//! Every account is settled in memory before it is validated or updated:
//! funding accrued since each position's index snapshot and yield accrued
//! since each yield snapshot are folded into the main settlement-asset
//! balance, and all snapshots move to the current market values.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, Zero};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::external::MarketRegistry;
use crate::types::{LedgerError, LedgerResult, PerpetualPosition, Subaccount};
use crate::utils::decimal::div_ppm_floor;

/// A subaccount with funding and yield applied, and what was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledSubaccount {
    pub subaccount: Subaccount,
    /// Funding paid per perpetual; negative means received. Only non-zero entries.
    pub funding_payments: BTreeMap<u32, BigInt>,
    /// Net yield credited to the main balance (may be negative for shorts).
    pub yield_claimed: BigInt,
}

/// Parse a rational index string (`"n/d"` or `"n"`). Empty means zero.
pub fn parse_yield_index(raw: &str) -> LedgerResult<BigRational> {
    if raw.is_empty() {
        return Ok(BigRational::zero());
    }
    let index = BigRational::from_str(raw)
        .map_err(|_| LedgerError::MalformedYieldIndex(raw.to_string()))?;
    if index.is_negative() {
        return Err(LedgerError::MalformedYieldIndex(raw.to_string()));
    }
    Ok(index)
}

/// Canonical `n/d` form.
pub fn format_yield_index(index: &BigRational) -> String {
    format!("{}/{}", index.numer(), index.denom())
}

/// Funding owed by a position in ppm of a quote quantum: positive means received.
pub fn funding_settlement_ppm(
    market_funding_index: &BigInt,
    position_funding_index: &BigInt,
    quantums: &BigInt,
) -> BigInt {
    -((market_funding_index - position_funding_index) * quantums)
}

/// Yield accrued by `quantums` between two indices, rounded down.
pub fn position_yield(
    quantums: &BigInt,
    market_index: &BigRational,
    position_index: &BigRational,
) -> BigInt {
    (BigRational::from_integer(quantums.clone()) * (market_index - position_index))
        .floor()
        .to_integer()
}

/// Yield accrued by a positive main balance: `floor(balance * global / own) - balance`.
/// An account snapshot of zero counts as one.
pub fn asset_yield(balance: &BigInt, global: &BigRational, own: &BigRational) -> BigInt {
    if !balance.is_positive() || global.is_zero() {
        return BigInt::zero();
    }
    let own = if own.is_zero() {
        BigRational::one()
    } else {
        own.clone()
    };
    let grown = (BigRational::from_integer(balance.clone()) * global / own)
        .floor()
        .to_integer();
    grown - balance
}

/// Settle funding and yield of every position and of the main balance.
pub fn settle_subaccount<R>(subaccount: &Subaccount, markets: &R) -> LedgerResult<SettledSubaccount>
where
    R: MarketRegistry + ?Sized,
{
    let global_index_raw = markets.settlement_asset_yield_index();
    let global_index = parse_yield_index(&global_index_raw)?;
    let own_index = parse_yield_index(&subaccount.asset_yield_index)?;
    if global_index < own_index {
        return Err(LedgerError::YieldIndexDecreased {
            previous: subaccount.asset_yield_index.clone(),
            current: global_index_raw,
        });
    }

    let balance = subaccount.settlement_balance();
    let mut total_settlement_ppm = BigInt::zero();
    let mut yield_claimed = asset_yield(&balance, &global_index, &own_index);
    let mut funding_payments = BTreeMap::new();
    let mut positions = Vec::with_capacity(subaccount.perpetual_positions.len());

    for position in &subaccount.perpetual_positions {
        let perpetual = markets.get_perpetual(position.perpetual_id)?;

        let settlement_ppm = funding_settlement_ppm(
            &perpetual.funding_index,
            &position.funding_index,
            &position.quantums,
        );
        if !settlement_ppm.is_zero() {
            funding_payments.insert(position.perpetual_id, -div_ppm_floor(&settlement_ppm));
        }
        total_settlement_ppm += &settlement_ppm;

        let market_yield = parse_yield_index(&perpetual.yield_index)?;
        let position_yield_index = parse_yield_index(&position.yield_index)?;
        if market_yield < position_yield_index {
            return Err(LedgerError::YieldIndexDecreased {
                previous: position.yield_index.clone(),
                current: perpetual.yield_index.clone(),
            });
        }
        yield_claimed += position_yield(&position.quantums, &market_yield, &position_yield_index);

        positions.push(PerpetualPosition {
            perpetual_id: position.perpetual_id,
            quantums: position.quantums.clone(),
            funding_index: perpetual.funding_index.clone(),
            yield_index: perpetual.yield_index.clone(),
            quote_balance: position.quote_balance.clone(),
        });
    }

    let funding = div_ppm_floor(&total_settlement_ppm);
    let mut settled = subaccount.clone();
    settled.perpetual_positions = positions;
    settled.set_settlement_balance(&balance + &funding + &yield_claimed);
    settled.asset_yield_index = global_index_raw;

    if !funding.is_zero() || !yield_claimed.is_zero() {
        debug!(
            subaccount = %subaccount.id,
            funding = %funding,
            yield_claimed = %yield_claimed,
            "Settled funding and yield"
        );
    }

    Ok(SettledSubaccount {
        subaccount: settled,
        funding_payments,
        yield_claimed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryMarkets;
    use crate::types::{LiquidityTier, MarketType, PerpetualInfo, SubaccountId};
    use rust_decimal_macros::dec;

    fn market(id: u32, funding_index: i64, yield_index: &str) -> PerpetualInfo {
        let mut perpetual = PerpetualInfo::new(
            id,
            format!("P{}-USD", id),
            MarketType::Cross,
            dec!(1),
            -6,
            LiquidityTier {
                id: 0,
                name: "Zero".to_string(),
                initial_margin_ppm: 0,
                maintenance_fraction_ppm: 0,
                ..LiquidityTier::default()
            },
        );
        perpetual.funding_index = BigInt::from(funding_index);
        perpetual.yield_index = yield_index.to_string();
        perpetual
    }

    fn position(
        id: u32,
        quantums: i64,
        funding_index: i64,
        yield_index: &str,
    ) -> PerpetualPosition {
        PerpetualPosition {
            perpetual_id: id,
            quantums: BigInt::from(quantums),
            funding_index: BigInt::from(funding_index),
            yield_index: yield_index.to_string(),
            quote_balance: BigInt::zero(),
        }
    }

    fn account(balance: i64, own_index: &str, positions: Vec<PerpetualPosition>) -> Subaccount {
        let mut subaccount = Subaccount::empty(SubaccountId::new("alice", 0));
        subaccount.set_settlement_balance(BigInt::from(balance));
        subaccount.asset_yield_index = own_index.to_string();
        subaccount.perpetual_positions = positions;
        subaccount
    }

    #[test]
    fn test_long_pays_positive_funding() {
        let markets = InMemoryMarkets::new(vec![market(0, 1_000_000, "0/1")]);
        let settled = settle_subaccount(
            &account(1_000, "0/1", vec![position(0, 100, 0, "0/1")]),
            &markets,
        )
        .unwrap();

        assert_eq!(settled.subaccount.settlement_balance(), BigInt::from(900));
        assert_eq!(settled.funding_payments.get(&0), Some(&BigInt::from(100)));
        assert_eq!(
            settled.subaccount.perpetual_positions[0].funding_index,
            BigInt::from(1_000_000)
        );
    }

    #[test]
    fn test_funding_rounds_towards_negative_infinity() {
        let markets = InMemoryMarkets::new(vec![market(0, 3, "0/1"), market(1, 3, "0/1")]);
        let settled = settle_subaccount(
            &account(
                1_000,
                "0/1",
                vec![position(0, 1, 0, "0/1"), position(1, -1, 0, "0/1")],
            ),
            &markets,
        )
        .unwrap();
        // Net settlement is zero ppm, but each payment is rounded on its own.
        assert_eq!(settled.subaccount.settlement_balance(), BigInt::from(1_000));
        assert_eq!(settled.funding_payments.get(&0), Some(&BigInt::from(1)));
        assert_eq!(settled.funding_payments.get(&1), Some(&BigInt::from(0)));
    }

    #[test]
    fn test_zero_funding_is_not_reported() {
        let markets = InMemoryMarkets::new(vec![market(0, 5, "0/1")]);
        let settled =
            settle_subaccount(&account(10, "0/1", vec![position(0, 100, 5, "0/1")]), &markets)
                .unwrap();
        assert!(settled.funding_payments.is_empty());
        assert_eq!(settled.subaccount.settlement_balance(), BigInt::from(10));
    }

    #[test]
    fn test_asset_yield_with_zero_snapshot() {
        let mut markets = InMemoryMarkets::new(vec![]);
        markets.set_asset_yield_index("2/1");
        let stored = account(100_000_000_000, "0/1", vec![]);
        let settled = settle_subaccount(&stored, &markets).unwrap();
        assert_eq!(
            settled.subaccount.settlement_balance(),
            BigInt::from(200_000_000_000i64)
        );
        assert_eq!(settled.yield_claimed, BigInt::from(100_000_000_000i64));
        assert_eq!(settled.subaccount.asset_yield_index, "2/1");
    }

    #[test]
    fn test_perpetual_and_asset_yield() {
        let mut markets = InMemoryMarkets::new(vec![market(0, 0, "11/3"), market(1, 0, "4/3")]);
        markets.set_asset_yield_index("12/10");
        let settled = settle_subaccount(
            &account(
                100_000_000_000,
                "12/11",
                vec![
                    position(0, 100_000_000, 0, "1/2"),
                    position(1, -2_000_000_000, 0, "11/9"),
                ],
            ),
            &markets,
        )
        .unwrap();

        assert_eq!(settled.yield_claimed, BigInt::from(10_094_444_443i64));
        assert_eq!(
            settled.subaccount.settlement_balance(),
            BigInt::from(110_094_444_443i64)
        );
        assert_eq!(settled.subaccount.perpetual_positions[0].yield_index, "11/3");
        assert_eq!(settled.subaccount.perpetual_positions[1].yield_index, "4/3");
    }

    #[test]
    fn test_negative_balance_claims_no_asset_yield() {
        let mut markets = InMemoryMarkets::new(vec![]);
        markets.set_asset_yield_index("2/1");
        let settled = settle_subaccount(&account(-50, "1/1", vec![]), &markets).unwrap();
        assert_eq!(settled.subaccount.settlement_balance(), BigInt::from(-50));
        assert!(settled.yield_claimed.is_zero());
    }

    #[test]
    fn test_malformed_and_decreasing_indices_are_fatal() {
        let markets = InMemoryMarkets::new(vec![market(0, 0, "1/2")]);
        assert!(matches!(
            settle_subaccount(&account(1, "x/1", vec![]), &markets),
            Err(LedgerError::MalformedYieldIndex(_))
        ));
        assert!(matches!(
            settle_subaccount(&account(1, "0/1", vec![position(0, 1, 0, "1/0")]), &markets),
            Err(LedgerError::MalformedYieldIndex(_))
        ));
        assert!(matches!(
            settle_subaccount(&account(1, "0/1", vec![position(0, 1, 0, "2/3")]), &markets),
            Err(LedgerError::YieldIndexDecreased { .. })
        ));
    }

    #[test]
    fn test_format_yield_index_is_reduced() {
        let index = parse_yield_index("12/10").unwrap();
        assert_eq!(format_yield_index(&index), "6/5");
        assert_eq!(format_yield_index(&parse_yield_index("").unwrap()), "0/1");
    }
}
