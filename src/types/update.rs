//! Proposed position deltas and their per-update outcomes.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::error::LedgerError;
use super::subaccount::{Subaccount, SubaccountId};

/// Change to one asset balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetUpdate {
    pub asset_id: u32,
    #[serde(with = "crate::utils::bigint_str")]
    pub quantums_delta: BigInt,
}

/// Change to the size of one perpetual position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualUpdate {
    pub perpetual_id: u32,
    #[serde(with = "crate::utils::bigint_str")]
    pub quantums_delta: BigInt,
}

/// A proposed set of deltas against one subaccount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub subaccount_id: SubaccountId,
    pub asset_updates: Vec<AssetUpdate>,
    pub perpetual_updates: Vec<PerpetualUpdate>,
}

impl Update {
    pub fn new(subaccount_id: SubaccountId) -> Self {
        Self {
            subaccount_id,
            asset_updates: Vec::new(),
            perpetual_updates: Vec::new(),
        }
    }

    /// Add an asset delta.
    pub fn with_asset(mut self, asset_id: u32, quantums_delta: impl Into<BigInt>) -> Self {
        self.asset_updates.push(AssetUpdate {
            asset_id,
            quantums_delta: quantums_delta.into(),
        });
        self
    }

    /// Add a perpetual delta.
    pub fn with_perpetual(mut self, perpetual_id: u32, quantums_delta: impl Into<BigInt>) -> Self {
        self.perpetual_updates.push(PerpetualUpdate {
            perpetual_id,
            quantums_delta: quantums_delta.into(),
        });
        self
    }

    /// Reject an update naming the same asset or perpetual twice.
    pub fn ensure_unique_positions(&self) -> Result<(), LedgerError> {
        let mut assets = BTreeSet::new();
        for u in &self.asset_updates {
            if !assets.insert(u.asset_id) {
                return Err(LedgerError::NonUniquePositionUpdates {
                    subaccount: self.subaccount_id.clone(),
                    kind: "asset",
                    id: u.asset_id,
                });
            }
        }
        let mut perpetuals = BTreeSet::new();
        for u in &self.perpetual_updates {
            if !perpetuals.insert(u.perpetual_id) {
                return Err(LedgerError::NonUniquePositionUpdates {
                    subaccount: self.subaccount_id.clone(),
                    kind: "perpetual",
                    id: u.perpetual_id,
                });
            }
        }
        Ok(())
    }
}

/// An update paired with the fully settled snapshot of its subaccount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledUpdate {
    pub settled_subaccount: Subaccount,
    pub asset_updates: Vec<AssetUpdate>,
    pub perpetual_updates: Vec<PerpetualUpdate>,
}

impl SettledUpdate {
    /// The same snapshot with no deltas, i.e. the pre-update state.
    pub fn without_deltas(&self) -> Self {
        Self {
            settled_subaccount: self.settled_subaccount.clone(),
            asset_updates: Vec::new(),
            perpetual_updates: Vec::new(),
        }
    }
}

/// Why a batch of updates is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateType {
    Deposit,
    Withdrawal,
    Transfer,
    Match,
    CollatCheck,
}

impl UpdateType {
    /// Withdrawals and transfers are gated by the negative-TNC window.
    pub fn is_gated(&self) -> bool {
        matches!(self, UpdateType::Withdrawal | UpdateType::Transfer)
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateType::Deposit => "deposit",
            UpdateType::Withdrawal => "withdrawal",
            UpdateType::Transfer => "transfer",
            UpdateType::Match => "match",
            UpdateType::CollatCheck => "collat_check",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of validating one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateResult {
    Success,
    NewlyUndercollateralized,
    StillUndercollateralized,
    ViolatesIsolatedSubaccountConstraints,
    WithdrawalsAndTransfersBlocked,
}

impl UpdateResult {
    pub fn is_success(&self) -> bool {
        *self == UpdateResult::Success
    }
}

impl fmt::Display for UpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateResult::Success => "Success",
            UpdateResult::NewlyUndercollateralized => "NewlyUndercollateralized",
            UpdateResult::StillUndercollateralized => "StillUndercollateralized",
            UpdateResult::ViolatesIsolatedSubaccountConstraints => {
                "ViolatesIsolatedSubaccountConstraints"
            }
            UpdateResult::WithdrawalsAndTransfersBlocked => "WithdrawalsAndTransfersBlocked",
        };
        write!(f, "{}", name)
    }
}
