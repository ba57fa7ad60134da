//! Subaccount state as persisted by the ledger.

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Asset id of the settlement asset (the quote currency every position settles in).
pub const SETTLEMENT_ASSET_ID: u32 = 0;

/// Yield index snapshot of an account or position that has never claimed yield.
pub const ZERO_YIELD_INDEX: &str = "0/1";

/// Identifies a subaccount: an owner address and a per-owner number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubaccountId {
    pub owner: String,
    pub number: u32,
}

impl SubaccountId {
    pub fn new(owner: impl Into<String>, number: u32) -> Self {
        Self {
            owner: owner.into(),
            number,
        }
    }

    /// Store key suffix: owner bytes, a separator, then the big-endian number.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.owner.len() + 5);
        key.extend_from_slice(self.owner.as_bytes());
        key.push(b'/');
        key.extend_from_slice(&self.number.to_be_bytes());
        key
    }
}

impl fmt::Display for SubaccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.number)
    }
}

/// Which side of a market a position is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side of a non-zero signed size.
    pub fn of(quantums: &BigInt) -> Self {
        if quantums.is_negative() {
            PositionSide::Short
        } else {
            PositionSide::Long
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            PositionSide::Long => 0,
            PositionSide::Short => 1,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Balance of a single asset, in atomic units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPosition {
    pub asset_id: u32,
    #[serde(with = "crate::utils::bigint_str")]
    pub quantums: BigInt,
}

/// Open position in a perpetual market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualPosition {
    pub perpetual_id: u32,
    /// Signed size in base quantums; positive is long.
    #[serde(with = "crate::utils::bigint_str")]
    pub quantums: BigInt,
    /// Market funding index at the last settlement of this position.
    #[serde(with = "crate::utils::bigint_str")]
    pub funding_index: BigInt,
    /// Market yield index at the last settlement, as a rational string (`n/d`).
    pub yield_index: String,
    /// Segregated collateral held by this position (isolated markets only).
    #[serde(with = "crate::utils::bigint_str", default)]
    pub quote_balance: BigInt,
}

impl PerpetualPosition {
    pub fn side(&self) -> PositionSide {
        PositionSide::of(&self.quantums)
    }
}

/// A subaccount and all of its positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subaccount {
    pub id: SubaccountId,
    /// Sorted by asset id; never contains a zero balance.
    pub asset_positions: Vec<AssetPosition>,
    /// Sorted by perpetual id; never contains a zero size.
    pub perpetual_positions: Vec<PerpetualPosition>,
    pub margin_enabled: bool,
    /// Settlement-asset yield index at the last settlement.
    pub asset_yield_index: String,
}

impl Subaccount {
    /// A subaccount that has never been written to the store.
    pub fn empty(id: SubaccountId) -> Self {
        Self {
            id,
            asset_positions: Vec::new(),
            perpetual_positions: Vec::new(),
            margin_enabled: false,
            asset_yield_index: ZERO_YIELD_INDEX.to_string(),
        }
    }

    /// True when the subaccount holds nothing and should be removed from state.
    pub fn is_empty(&self) -> bool {
        self.asset_positions.is_empty() && self.perpetual_positions.is_empty()
    }

    /// Main settlement-asset balance (zero when absent).
    pub fn settlement_balance(&self) -> BigInt {
        self.asset_positions
            .iter()
            .find(|p| p.asset_id == SETTLEMENT_ASSET_ID)
            .map(|p| p.quantums.clone())
            .unwrap_or_default()
    }

    /// Overwrite the main settlement-asset balance, dropping the entry when zero.
    pub fn set_settlement_balance(&mut self, quantums: BigInt) {
        self.asset_positions
            .retain(|p| p.asset_id != SETTLEMENT_ASSET_ID);
        if !quantums.is_zero() {
            self.asset_positions.push(AssetPosition {
                asset_id: SETTLEMENT_ASSET_ID,
                quantums,
            });
            self.asset_positions.sort_by_key(|p| p.asset_id);
        }
    }

    pub fn perpetual_position(&self, perpetual_id: u32) -> Option<&PerpetualPosition> {
        self.perpetual_positions
            .iter()
            .find(|p| p.perpetual_id == perpetual_id)
    }

    /// Main balance plus every position's segregated quote balance.
    pub fn total_settlement_quantums(&self) -> BigInt {
        self.perpetual_positions
            .iter()
            .fold(self.settlement_balance(), |acc, p| acc + &p.quote_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_settlement_balance_removes_zero() {
        let mut subaccount = Subaccount::empty(SubaccountId::new("alice", 0));
        subaccount.set_settlement_balance(BigInt::from(100));
        assert_eq!(subaccount.settlement_balance(), BigInt::from(100));
        assert!(!subaccount.is_empty());

        subaccount.set_settlement_balance(BigInt::zero());
        assert!(subaccount.asset_positions.is_empty());
        assert!(subaccount.is_empty());
    }

    #[test]
    fn test_total_settlement_quantums_includes_quote_balances() {
        let mut subaccount = Subaccount::empty(SubaccountId::new("alice", 0));
        subaccount.set_settlement_balance(BigInt::from(-40));
        subaccount.perpetual_positions.push(PerpetualPosition {
            perpetual_id: 3,
            quantums: BigInt::from(-5),
            funding_index: BigInt::zero(),
            yield_index: ZERO_YIELD_INDEX.to_string(),
            quote_balance: BigInt::from(100),
        });
        assert_eq!(subaccount.total_settlement_quantums(), BigInt::from(60));
        assert_eq!(subaccount.perpetual_positions[0].side(), PositionSide::Short);
    }

    #[test]
    fn test_subaccount_keys_order_by_owner_then_number() {
        let a = SubaccountId::new("alice", 1).to_key();
        let b = SubaccountId::new("alice", 256).to_key();
        let c = SubaccountId::new("bob", 0).to_key();
        assert!(a < b);
        assert!(b < c);
    }
}
