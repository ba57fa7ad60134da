//! Per-position segregated collateral.
//!
//! Positions in isolated markets carry a private quote balance on top of the
//! account's main settlement-asset balance. Closing such a position releases
//! its quote balance to the main balance. If an open position ends up below
//! its own maintenance requirement, a best-effort pass first harvests every
//! position's excess into the main balance and then funds shortfalls from it,
//! in market-id order. Collateral is only ever moved, never created.

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use tracing::{debug, info};

use crate::external::MarketRegistry;
use crate::risk::perpetual_risk;
use crate::types::{LedgerResult, PerpetualInfo, PerpetualPosition, Subaccount};
use crate::utils::decimal::positive_part;

/// Collateral moved by one rebalancing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Released from closed positions to the main balance.
    pub released: BigInt,
    /// Excess moved from healthy positions to the main balance.
    pub harvested: BigInt,
    /// Moved from the main balance to positions below maintenance.
    pub funded: BigInt,
}

impl RebalanceReport {
    pub fn is_noop(&self) -> bool {
        self.released.is_zero() && self.harvested.is_zero() && self.funded.is_zero()
    }
}

/// `NC - MMR` of a position counting its quote balance.
fn maintenance_surplus(perpetual: &PerpetualInfo, position: &PerpetualPosition) -> BigInt {
    let risk = perpetual_risk(perpetual, &position.quantums, &position.quote_balance);
    risk.nc - risk.mmr
}

/// Rebalance `subaccount` after an update closed `closed` and left the rest open.
pub fn rebalance_segregated_collateral<R>(
    subaccount: &mut Subaccount,
    closed: &[PerpetualPosition],
    markets: &R,
) -> LedgerResult<RebalanceReport>
where
    R: MarketRegistry + ?Sized,
{
    let mut report = RebalanceReport::default();
    let mut main = subaccount.settlement_balance();

    for position in closed {
        report.released += &position.quote_balance;
        main += &position.quote_balance;
    }

    let mut segregated = Vec::new();
    for (i, position) in subaccount.perpetual_positions.iter().enumerate() {
        let perpetual = markets.get_perpetual(position.perpetual_id)?;
        if perpetual.is_isolated() {
            segregated.push((i, perpetual));
        }
    }

    let any_short = segregated.iter().any(|(i, perpetual)| {
        maintenance_surplus(perpetual, &subaccount.perpetual_positions[*i]).is_negative()
    });

    if any_short {
        for (i, perpetual) in &segregated {
            let position = &mut subaccount.perpetual_positions[*i];
            let excess = maintenance_surplus(perpetual, position)
                .min(position.quote_balance.clone());
            if excess.is_positive() {
                position.quote_balance -= &excess;
                main += &excess;
                report.harvested += excess;
            }
        }

        for (i, perpetual) in &segregated {
            let position = &mut subaccount.perpetual_positions[*i];
            let shortfall = -maintenance_surplus(perpetual, position);
            if !shortfall.is_positive() {
                continue;
            }
            let amount = shortfall.min(positive_part(&main));
            if amount.is_positive() {
                position.quote_balance += &amount;
                main -= &amount;
                report.funded += &amount;
            }
            if !maintenance_surplus(perpetual, position).is_negative() {
                continue;
            }
            info!(
                subaccount = %subaccount.id,
                perpetual_id = perpetual.id,
                "Position still below maintenance after rebalancing"
            );
        }
    }

    subaccount.set_settlement_balance(main);

    if !report.is_noop() {
        debug!(
            subaccount = %subaccount.id,
            released = %report.released,
            harvested = %report.harvested,
            funded = %report.funded,
            "Rebalanced segregated collateral"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryMarkets;
    use crate::types::{LiquidityTier, MarketType, SubaccountId, ZERO_YIELD_INDEX};
    use rust_decimal_macros::dec;

    // 10% initial, half of it maintenance; 1 base quantum = 1 quote quantum.
    fn isolated(id: u32) -> PerpetualInfo {
        PerpetualInfo::new(
            id,
            format!("ISO{}-USD", id),
            MarketType::Isolated,
            dec!(1),
            -6,
            LiquidityTier {
                id: 1,
                name: "Isolated".to_string(),
                initial_margin_ppm: 100_000,
                maintenance_fraction_ppm: 500_000,
                ..LiquidityTier::default()
            },
        )
    }

    fn position(id: u32, quantums: i64, quote_balance: i64) -> PerpetualPosition {
        PerpetualPosition {
            perpetual_id: id,
            quantums: BigInt::from(quantums),
            funding_index: BigInt::zero(),
            yield_index: ZERO_YIELD_INDEX.to_string(),
            quote_balance: BigInt::from(quote_balance),
        }
    }

    fn account(main: i64, positions: Vec<PerpetualPosition>) -> Subaccount {
        let mut subaccount = Subaccount::empty(SubaccountId::new("alice", 0));
        subaccount.set_settlement_balance(BigInt::from(main));
        subaccount.perpetual_positions = positions;
        subaccount
    }

    #[test]
    fn test_closing_releases_quote_balance() {
        let markets = InMemoryMarkets::new(vec![isolated(3)]);
        let mut subaccount = account(100, vec![]);
        let report =
            rebalance_segregated_collateral(&mut subaccount, &[position(3, 0, 40)], &markets)
                .unwrap();
        assert_eq!(subaccount.settlement_balance(), BigInt::from(140));
        assert_eq!(report.released, BigInt::from(40));
    }

    #[test]
    fn test_healthy_positions_are_left_alone() {
        let markets = InMemoryMarkets::new(vec![isolated(3)]);
        // Long 1000 at price 1: NC = 1000 + 10, MMR = 50.
        let mut subaccount = account(100, vec![position(3, 1_000, 10)]);
        let report = rebalance_segregated_collateral(&mut subaccount, &[], &markets).unwrap();
        assert!(report.is_noop());
        assert_eq!(subaccount.perpetual_positions[0].quote_balance, BigInt::from(10));
    }

    #[test]
    fn test_shortfall_is_funded_from_harvest_and_main() {
        let markets = InMemoryMarkets::new(vec![isolated(3), isolated(4)]);
        // Short 1000 with 1020 quote: NC = -1000 + 1020 = 20, MMR = 50, short by 30.
        // Long 100 with 40 quote: NC = 140, MMR = 5, excess capped at its 40.
        let mut subaccount = account(
            0,
            vec![position(3, -1_000, 1_020), position(4, 100, 40)],
        );
        let before = subaccount.total_settlement_quantums();

        let report = rebalance_segregated_collateral(&mut subaccount, &[], &markets).unwrap();

        assert_eq!(report.harvested, BigInt::from(40));
        assert_eq!(report.funded, BigInt::from(30));
        assert_eq!(subaccount.perpetual_positions[0].quote_balance, BigInt::from(1_050));
        assert_eq!(subaccount.perpetual_positions[1].quote_balance, BigInt::from(0));
        assert_eq!(subaccount.settlement_balance(), BigInt::from(10));
        assert_eq!(subaccount.total_settlement_quantums(), before);
    }

    #[test]
    fn test_best_effort_when_main_balance_is_short() {
        let markets = InMemoryMarkets::new(vec![isolated(3)]);
        // Short 1000 with 1000 quote: NC = 0, MMR = 50; only 20 available.
        let mut subaccount = account(20, vec![position(3, -1_000, 1_000)]);
        let before = subaccount.total_settlement_quantums();

        let report = rebalance_segregated_collateral(&mut subaccount, &[], &markets).unwrap();

        assert_eq!(report.funded, BigInt::from(20));
        assert_eq!(subaccount.settlement_balance(), BigInt::from(0));
        assert_eq!(subaccount.perpetual_positions[0].quote_balance, BigInt::from(1_020));
        assert_eq!(subaccount.total_settlement_quantums(), before);
    }

    #[test]
    fn test_negative_main_balance_funds_nothing() {
        let markets = InMemoryMarkets::new(vec![isolated(3)]);
        let mut subaccount = account(-10, vec![position(3, -1_000, 1_000)]);
        let report = rebalance_segregated_collateral(&mut subaccount, &[], &markets).unwrap();
        assert!(report.funded.is_zero());
        assert_eq!(subaccount.settlement_balance(), BigInt::from(-10));
    }

    #[test]
    fn test_conservation_across_mixed_pass() {
        let markets = InMemoryMarkets::new(vec![isolated(3), isolated(4), isolated(5)]);
        let closed = [position(6, 0, 7)];
        let mut subaccount = account(
            -3,
            vec![
                position(3, -2_000, 1_900),
                position(4, 500, 300),
                position(5, -10, 200),
            ],
        );
        let before = subaccount.total_settlement_quantums() + BigInt::from(7);

        rebalance_segregated_collateral(&mut subaccount, &closed, &markets).unwrap();

        assert_eq!(subaccount.total_settlement_quantums(), before);
        assert!(subaccount
            .perpetual_positions
            .iter()
            .all(|p| !p.quote_balance.is_negative()));
    }
}
