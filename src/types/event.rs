//! Event emitted for every subaccount changed by a committed batch.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::subaccount::{AssetPosition, PerpetualPosition, SubaccountId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountUpdateEvent {
    pub subaccount_id: SubaccountId,
    /// Positions touched by the update or by funding; closed ones carry zero size.
    pub updated_perpetual_positions: Vec<PerpetualPosition>,
    /// Balances touched by the update; closed ones carry zero quantums.
    pub updated_asset_positions: Vec<AssetPosition>,
    /// Funding paid per perpetual (positive means the account paid).
    #[serde(with = "crate::utils::bigint_str::map")]
    pub funding_payments: BTreeMap<u32, BigInt>,
    pub yield_index: String,
}
