//! Withdrawal and transfer gating after negative total net collateral.
//!
//! Each collateral pool remembers the last block at which one of its accounts
//! was seen with negative net collateral. For a configured number of blocks
//! after that, withdrawals and transfers touching the pool are rejected.
//! A recorded chain outage opens the same window.

use num_traits::Signed;
use tracing::{debug, info, warn};

use crate::external::MarketRegistry;
use crate::risk::{risk_for_update, settle_subaccount};
use crate::store::{keys, KvStore};
use crate::types::{
    Address, LedgerError, LedgerResult, SettledUpdate, StoreError, SubaccountId,
};

use super::isolated::collateral_pool_of;
use super::{get_subaccount, BlockContext};

/// Last block at which `pool` had an account with negative net collateral; 0 if never.
pub fn get_negative_tnc_seen_at<S: KvStore>(store: &S, pool: &Address) -> LedgerResult<u32> {
    match store.get(&keys::negative_tnc_seen_at(pool))? {
        Some(bytes) => {
            let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::Corrupted {
                    key: format!("negative TNC marker of {}", pool),
                    reason: format!("expected 4 bytes, got {}", bytes.len()),
                }
            })?;
            Ok(u32::from_be_bytes(raw))
        }
        None => Ok(0),
    }
}

/// Record `block` for `pool`. Moving the marker back is fatal; repeating it is a no-op.
pub fn set_negative_tnc_seen_at<S: KvStore>(
    store: &mut S,
    pool: &Address,
    block: u32,
) -> LedgerResult<()> {
    let stored = get_negative_tnc_seen_at(store, pool)?;
    if block < stored {
        return Err(LedgerError::NegativeTncBlockRegression {
            pool: *pool,
            stored,
            requested: block,
        });
    }
    if block == stored {
        return Ok(());
    }
    store.set(&keys::negative_tnc_seen_at(pool), &block.to_be_bytes())?;
    info!(pool = %pool, block, "Recorded negative TNC block");
    Ok(())
}

/// Window check shared by negative-TNC markers and chain outages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawalGate {
    pub window: u32,
}

impl WithdrawalGate {
    pub fn new(window: u32) -> Self {
        Self { window }
    }

    /// Whether a marker at `marker` still blocks at `current`.
    pub fn is_blocked(&self, current: u32, marker: u32) -> LedgerResult<bool> {
        if marker == 0 {
            return Ok(false);
        }
        if current < marker {
            return Err(LedgerError::BlockBeforeMarker { current, marker });
        }
        Ok(current - marker < self.window)
    }

    /// Gate a withdrawal or transfer touching `pools`. Uses the latest marker
    /// among them, then the chain outage if one is recorded.
    pub fn check<S: KvStore>(
        &self,
        store: &S,
        ctx: &BlockContext,
        pools: &[Address],
    ) -> LedgerResult<bool> {
        let mut marker = 0u32;
        for pool in pools {
            marker = marker.max(get_negative_tnc_seen_at(store, pool)?);
        }
        if self.is_blocked(ctx.height, marker)? {
            warn!(
                block = ctx.height,
                marker,
                window = self.window,
                "Withdrawals and transfers blocked after negative TNC"
            );
            return Ok(true);
        }
        if let Some(outage) = ctx.chain_outage_seen_at {
            if self.is_blocked(ctx.height, outage)? {
                warn!(
                    block = ctx.height,
                    outage,
                    window = self.window,
                    "Withdrawals and transfers blocked after chain outage"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Settle each account in memory and mark the pool of any with negative net
/// collateral at the current block. Returns the pools that were marked.
pub fn mark_negative_tnc_subaccounts<S, R>(
    store: &mut S,
    markets: &R,
    ctx: &BlockContext,
    ids: &[SubaccountId],
) -> LedgerResult<Vec<Address>>
where
    S: KvStore,
    R: MarketRegistry + ?Sized,
{
    let mut marked: Vec<Address> = Vec::new();
    for id in ids {
        let subaccount = get_subaccount(store, id)?;
        let settled = settle_subaccount(&subaccount, markets)?;
        let risk = risk_for_update(
            &SettledUpdate {
                settled_subaccount: settled.subaccount,
                asset_updates: Vec::new(),
                perpetual_updates: Vec::new(),
            },
            markets,
        )?;
        if !risk.nc.is_negative() {
            continue;
        }
        let pool = collateral_pool_of(&subaccount, markets)?;
        debug!(subaccount = %id, nc = %risk.nc, pool = %pool, "Negative net collateral");
        set_negative_tnc_seen_at(store, &pool, ctx.height)?;
        if !marked.contains(&pool) {
            marked.push(pool);
        }
    }
    Ok(marked)
}
