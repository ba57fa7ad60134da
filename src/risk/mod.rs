//! Risk calculation for subaccounts.
//!
//! - Net collateral and margin requirements of a settled account plus deltas
//! - The state machine deciding which updates an undercollateralized account may take
//! - Funding and yield settlement applied before any check

mod margin;
mod settlement;
mod state_transition;

pub use margin::{
    asset_risk, asset_sizes_after, margin_requirements, perpetual_risk, perpetual_sizes_after,
    quote_quantums, risk_for_update, CollateralHealth, Risk,
};
pub use settlement::{
    asset_yield, format_yield_index, funding_settlement_ppm, parse_yield_index, position_yield,
    settle_subaccount, SettledSubaccount,
};
pub use state_transition::{undercollateralized_transition, update_result};
