//! Net collateral and margin requirements.
//!
//! All amounts are settlement-asset quantums. A perpetual position contributes
//! its notional value (plus any segregated quote balance) to net collateral and
//! `|notional|`-based initial and maintenance requirements; the settlement asset
//! contributes its balance and no requirement.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use std::collections::BTreeMap;
use std::fmt;

use crate::external::MarketRegistry;
use crate::types::{
    LedgerError, LedgerResult, PerpetualInfo, SettledUpdate, QUOTE_ATOMIC_RESOLUTION,
    SETTLEMENT_ASSET_ID,
};
use crate::utils::decimal::{decimal_parts, mul_pow10_floor, mul_ppm, ONE_MILLION};

/// Collateral and requirements of a position, an account, or a hypothetical update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Risk {
    /// Net collateral (signed)
    pub nc: BigInt,
    /// Initial margin requirement
    pub imr: BigInt,
    /// Maintenance margin requirement
    pub mmr: BigInt,
}

impl Risk {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn new(nc: impl Into<BigInt>, imr: impl Into<BigInt>, mmr: impl Into<BigInt>) -> Self {
        Self {
            nc: nc.into(),
            imr: imr.into(),
            mmr: mmr.into(),
        }
    }

    pub fn add_in_place(&mut self, other: &Risk) {
        self.nc += &other.nc;
        self.imr += &other.imr;
        self.mmr += &other.mmr;
    }

    /// Enough collateral to open positions.
    pub fn is_initial_collateralized(&self) -> bool {
        self.nc >= self.imr
    }

    /// Enough collateral to keep positions open.
    pub fn is_maintenance_collateralized(&self) -> bool {
        self.nc >= self.mmr
    }

    /// `MMR - NC`; larger means closer to liquidation.
    pub fn risk_score(&self) -> BigInt {
        &self.mmr - &self.nc
    }

    pub fn health(&self) -> CollateralHealth {
        if self.is_initial_collateralized() {
            CollateralHealth::Healthy
        } else if self.is_maintenance_collateralized() {
            CollateralHealth::BelowInitial
        } else {
            CollateralHealth::Liquidatable
        }
    }
}

/// Coarse collateralization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CollateralHealth {
    /// Net collateral covers the initial requirement
    Healthy,
    /// Covers maintenance but not initial: may only de-risk
    BelowInitial,
    /// Below maintenance: eligible for liquidation
    Liquidatable,
}

impl fmt::Display for CollateralHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollateralHealth::Healthy => write!(f, "healthy"),
            CollateralHealth::BelowInitial => write!(f, "below-initial"),
            CollateralHealth::Liquidatable => write!(f, "liquidatable"),
        }
    }
}

/// Value in quote quantums of `base_quantums` of a perpetual, rounded down.
///
/// `quantums * price * 10^(atomic_resolution - QUOTE_ATOMIC_RESOLUTION)`
pub fn quote_quantums(perpetual: &PerpetualInfo, base_quantums: &BigInt) -> BigInt {
    let (mantissa, scale) = decimal_parts(perpetual.price);
    let exponent = perpetual.atomic_resolution - QUOTE_ATOMIC_RESOLUTION - scale as i32;
    mul_pow10_floor(&(base_quantums * mantissa), exponent)
}

/// Initial margin rate of a market at its current open interest, in ppm.
///
/// Rises linearly from the tier's rate at the lower cap to 100% at the upper
/// cap, rounded down to a whole ppm.
pub fn adjusted_initial_margin_ppm(perpetual: &PerpetualInfo) -> u32 {
    let tier = &perpetual.liquidity_tier;
    if tier.open_interest_upper_cap == 0 || tier.initial_margin_ppm >= ONE_MILLION {
        return tier.initial_margin_ppm;
    }

    let open_interest = quote_quantums(perpetual, &perpetual.open_interest).abs();
    let lower = BigInt::from(tier.open_interest_lower_cap);
    let upper = BigInt::from(tier.open_interest_upper_cap);
    if open_interest <= lower {
        return tier.initial_margin_ppm;
    }
    if open_interest >= upper {
        return ONE_MILLION;
    }

    let headroom = ONE_MILLION - tier.initial_margin_ppm;
    let extra =
        (BigInt::from(headroom) * (&open_interest - &lower)).div_floor(&(&upper - &lower));
    match extra.to_u32() {
        Some(extra) => tier.initial_margin_ppm + extra,
        None => ONE_MILLION,
    }
}

/// `(initial, maintenance)` requirements of a position, both rounded up.
///
/// The initial requirement follows the open-interest-adjusted rate; the
/// maintenance requirement is a fraction of the unadjusted one.
pub fn margin_requirements(perpetual: &PerpetualInfo, base_quantums: &BigInt) -> (BigInt, BigInt) {
    if base_quantums.is_zero() {
        return (BigInt::zero(), BigInt::zero());
    }
    let notional = quote_quantums(perpetual, base_quantums).abs();
    let tier = &perpetual.liquidity_tier;
    let initial = mul_ppm(&notional, adjusted_initial_margin_ppm(perpetual), true);
    let base_initial = mul_ppm(&notional, tier.initial_margin_ppm, true);
    let maintenance = mul_ppm(&base_initial, tier.maintenance_fraction_ppm, true);
    (initial, maintenance)
}

/// Risk of a single perpetual position holding `quote_balance` of segregated collateral.
pub fn perpetual_risk(
    perpetual: &PerpetualInfo,
    base_quantums: &BigInt,
    quote_balance: &BigInt,
) -> Risk {
    let (imr, mmr) = margin_requirements(perpetual, base_quantums);
    Risk {
        nc: quote_quantums(perpetual, base_quantums) + quote_balance,
        imr,
        mmr,
    }
}

/// Risk of an asset balance. Only the settlement asset is supported.
pub fn asset_risk(asset_id: u32, quantums: &BigInt) -> LedgerResult<Risk> {
    if asset_id != SETTLEMENT_ASSET_ID {
        return Err(LedgerError::AssetNotSupported(asset_id));
    }
    Ok(Risk {
        nc: quantums.clone(),
        ..Risk::zero()
    })
}

/// Post-update sizes of every position, keyed by id. Positions that close
/// stay in the map with zero size.
pub fn asset_sizes_after(update: &SettledUpdate) -> BTreeMap<u32, BigInt> {
    let mut sizes: BTreeMap<u32, BigInt> = update
        .settled_subaccount
        .asset_positions
        .iter()
        .map(|p| (p.asset_id, p.quantums.clone()))
        .collect();
    for u in &update.asset_updates {
        *sizes.entry(u.asset_id).or_default() += &u.quantums_delta;
    }
    sizes
}

/// Post-update `(size, quote balance)` of every perpetual position, keyed by id.
pub fn perpetual_sizes_after(update: &SettledUpdate) -> BTreeMap<u32, (BigInt, BigInt)> {
    let mut sizes: BTreeMap<u32, (BigInt, BigInt)> = update
        .settled_subaccount
        .perpetual_positions
        .iter()
        .map(|p| (p.perpetual_id, (p.quantums.clone(), p.quote_balance.clone())))
        .collect();
    for u in &update.perpetual_updates {
        sizes.entry(u.perpetual_id).or_default().0 += &u.quantums_delta;
    }
    sizes
}

/// Net collateral and requirements of a settled account as if the update were applied.
pub fn risk_for_update<R>(update: &SettledUpdate, markets: &R) -> LedgerResult<Risk>
where
    R: MarketRegistry + ?Sized,
{
    let mut risk = Risk::zero();

    for (asset_id, quantums) in asset_sizes_after(update) {
        risk.add_in_place(&asset_risk(asset_id, &quantums)?);
    }

    for (perpetual_id, (quantums, quote_balance)) in perpetual_sizes_after(update) {
        let perpetual = markets.get_perpetual(perpetual_id)?;
        risk.add_in_place(&perpetual_risk(&perpetual, &quantums, &quote_balance));
    }

    Ok(risk)
}
