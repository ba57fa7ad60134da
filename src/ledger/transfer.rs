//! Movements of the settlement asset into, out of and between pools.
//!
//! Deposits, withdrawals and transfers validate the balance change first,
//! then move the real tokens and apply the change to the ledger together.
//! Fee, insurance fund and migration transfers only move tokens.

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use tracing::{debug, info};

use super::isolated::{collateral_pool_of, PoolTransfer};
use super::pipeline::simulate_transfers;
use super::{get_subaccount, BatchOutcome, BlockContext, Ledger};
use crate::external::{BankKeeper, EventSink, MarketRegistry};
use crate::store::KvStore;
use crate::types::{
    Address, LedgerError, LedgerResult, SubaccountId, Update, UpdateType, SETTLEMENT_ASSET_ID,
};

/// Part of a fill's fees owed to a third party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevenueShare {
    pub recipient: Address,
    pub quantums: BigInt,
}

/// Fees collected on one fill of a perpetual. Either fee may be negative
/// when it is a rebate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillFees {
    pub perpetual_id: u32,
    pub taker_fee: BigInt,
    pub maker_fee: BigInt,
    pub revenue_shares: Vec<RevenueShare>,
}

fn validate_amount(asset_id: u32, quantums: &BigInt) -> LedgerResult<()> {
    if asset_id != SETTLEMENT_ASSET_ID {
        return Err(LedgerError::AssetNotSupported(asset_id));
    }
    if !quantums.is_positive() {
        return Err(LedgerError::TransferQuantumsNotPositive(quantums.clone()));
    }
    Ok(())
}

/// Turn a failed outcome into an error naming the first rejected update.
fn ensure_success(updates: &[Update], outcome: &BatchOutcome) -> LedgerResult<()> {
    match updates
        .iter()
        .zip(&outcome.results)
        .find(|(_, result)| !result.is_success())
    {
        Some((update, result)) => Err(LedgerError::UpdateRejected {
            subaccount: update.subaccount_id.clone(),
            result: *result,
        }),
        None => Ok(()),
    }
}

impl<R, B, E> Ledger<R, B, E>
where
    R: MarketRegistry,
    B: BankKeeper,
    E: EventSink,
{
    fn pool_of<S: KvStore>(&self, store: &S, id: &SubaccountId) -> LedgerResult<Address> {
        collateral_pool_of(&get_subaccount(store, id)?, &self.markets)
    }

    fn validate_and_apply<S: KvStore>(
        &mut self,
        store: &mut S,
        ctx: &BlockContext,
        updates: &[Update],
        update_type: UpdateType,
        transfer: Option<(Address, Address)>,
        quantums: &BigInt,
    ) -> LedgerResult<()> {
        ensure_success(
            updates,
            &self.can_update_subaccounts(store, ctx, updates, update_type)?,
        )?;
        let external: Vec<PoolTransfer> = transfer
            .into_iter()
            .map(|(from, to)| PoolTransfer {
                from,
                to,
                quantums: quantums.clone(),
            })
            .collect();
        let outcome =
            self.update_subaccounts_with_transfers(store, ctx, updates, update_type, &external)?;
        ensure_success(updates, &outcome)?;
        info!(update_type = %update_type, quantums = %quantums, "Funds moved");
        Ok(())
    }

    /// Send every transfer, or none of them.
    fn send_all(&mut self, transfers: &[PoolTransfer]) -> LedgerResult<()> {
        simulate_transfers(&self.bank, transfers)?;
        for t in transfers {
            self.bank.send(&t.from, &t.to, &t.quantums)?;
            debug!(from = %t.from, to = %t.to, quantums = %t.quantums, "Tokens sent");
        }
        Ok(())
    }

    /// Credit `to` with tokens taken from the external account `from`.
    pub fn deposit_funds_to_subaccount<S: KvStore>(
        &mut self,
        store: &mut S,
        ctx: &BlockContext,
        from: &Address,
        to: &SubaccountId,
        asset_id: u32,
        quantums: &BigInt,
    ) -> LedgerResult<()> {
        validate_amount(asset_id, quantums)?;
        let pool = self.pool_of(store, to)?;
        let updates = [Update::new(to.clone()).with_asset(asset_id, quantums.clone())];
        self.validate_and_apply(
            store,
            ctx,
            &updates,
            UpdateType::Deposit,
            Some((*from, pool)),
            quantums,
        )
    }

    /// Debit `from` and pay the tokens out to the external account `to`.
    pub fn withdraw_funds_from_subaccount<S: KvStore>(
        &mut self,
        store: &mut S,
        ctx: &BlockContext,
        from: &SubaccountId,
        to: &Address,
        asset_id: u32,
        quantums: &BigInt,
    ) -> LedgerResult<()> {
        validate_amount(asset_id, quantums)?;
        let pool = self.pool_of(store, from)?;
        let updates = [Update::new(from.clone()).with_asset(asset_id, -quantums)];
        self.validate_and_apply(
            store,
            ctx,
            &updates,
            UpdateType::Withdrawal,
            Some((pool, *to)),
            quantums,
        )
    }

    /// Move balance between two subaccounts; tokens move only when they are
    /// backed by different pools.
    pub fn transfer_funds_between_subaccounts<S: KvStore>(
        &mut self,
        store: &mut S,
        ctx: &BlockContext,
        from: &SubaccountId,
        to: &SubaccountId,
        asset_id: u32,
        quantums: &BigInt,
    ) -> LedgerResult<()> {
        validate_amount(asset_id, quantums)?;
        let from_pool = self.pool_of(store, from)?;
        let to_pool = self.pool_of(store, to)?;
        let updates = [
            Update::new(from.clone()).with_asset(asset_id, -quantums),
            Update::new(to.clone()).with_asset(asset_id, quantums.clone()),
        ];
        let transfer = (from_pool != to_pool).then_some((from_pool, to_pool));
        self.validate_and_apply(store, ctx, &updates, UpdateType::Transfer, transfer, quantums)
    }

    /// Back an account's pool with yield already owed to it. Zero is a no-op.
    pub fn deposit_yield_to_subaccount<S: KvStore>(
        &mut self,
        store: &S,
        id: &SubaccountId,
        quantums: &BigInt,
    ) -> LedgerResult<()> {
        if quantums.is_negative() {
            return Err(LedgerError::NegativeYieldDeposit(quantums.clone()));
        }
        if quantums.is_zero() {
            return Ok(());
        }
        let pool = self.pool_of(store, id)?;
        self.send_all(&[PoolTransfer {
            from: Address::yield_pool(),
            to: pool,
            quantums: quantums.clone(),
        }])?;
        info!(subaccount = %id, quantums = %quantums, "Yield deposited");
        Ok(())
    }

    /// Move fees between two accounts; a negative amount moves them back.
    pub fn transfer_fees(
        &mut self,
        asset_id: u32,
        from: &Address,
        to: &Address,
        quantums: &BigInt,
    ) -> LedgerResult<()> {
        if asset_id != SETTLEMENT_ASSET_ID {
            return Err(LedgerError::AssetNotSupported(asset_id));
        }
        let transfers: Vec<PoolTransfer> = PoolTransfer::signed(*from, *to, quantums)
            .into_iter()
            .collect();
        self.send_all(&transfers)
    }

    /// Pay a fill's revenue shares out of the market's collateral pool and
    /// the rest of its fees to the fee collector.
    pub fn distribute_fees(&mut self, asset_id: u32, fees: &FillFees) -> LedgerResult<()> {
        if asset_id != SETTLEMENT_ASSET_ID {
            return Err(LedgerError::AssetNotSupported(asset_id));
        }
        let pool = self.markets.get_perpetual(fees.perpetual_id)?.collateral_pool();
        let total = &fees.taker_fee + &fees.maker_fee;
        let shared: BigInt = fees.revenue_shares.iter().map(|s| &s.quantums).sum();
        let remainder = &total - &shared;
        if remainder.is_negative() {
            return Err(LedgerError::RevenueSharesExceedFees { total, shared });
        }

        let transfers: Vec<PoolTransfer> = fees
            .revenue_shares
            .iter()
            .filter_map(|s| PoolTransfer::signed(pool, s.recipient, &s.quantums))
            .chain(PoolTransfer::signed(pool, Address::fee_collector(), &remainder))
            .collect();
        self.send_all(&transfers)?;
        info!(
            perpetual_id = fees.perpetual_id,
            total = %total,
            shared = %shared,
            "Fees distributed"
        );
        Ok(())
    }

    /// Settle a market's insurance fund against its collateral pool. A
    /// positive delta pays the fund; a negative one draws on it.
    pub fn transfer_insurance_fund_payments(
        &mut self,
        perpetual_id: u32,
        delta: &BigInt,
    ) -> LedgerResult<()> {
        let perpetual = self.markets.get_perpetual(perpetual_id)?;
        let transfers: Vec<PoolTransfer> = PoolTransfer::signed(
            perpetual.collateral_pool(),
            perpetual.insurance_fund(),
            delta,
        )
        .into_iter()
        .collect();
        self.send_all(&transfers)
    }

    /// Pay a builder its fee out of the market's collateral pool.
    pub fn transfer_builder_fees(
        &mut self,
        perpetual_id: u32,
        quantums: &BigInt,
        builder: &Address,
    ) -> LedgerResult<()> {
        let pool = self.markets.get_perpetual(perpetual_id)?.collateral_pool();
        if quantums.is_negative() {
            return Err(LedgerError::NegativeBuilderFee(quantums.clone()));
        }
        self.send_all(&[PoolTransfer {
            from: pool,
            to: *builder,
            quantums: quantums.clone(),
        }])
    }

    /// Move an isolated market's whole insurance fund into the cross fund.
    pub fn transfer_isolated_insurance_fund_to_cross(
        &mut self,
        perpetual_id: u32,
    ) -> LedgerResult<()> {
        self.markets.get_perpetual(perpetual_id)?;
        let fund = Address::isolated_insurance_fund(perpetual_id);
        self.sweep(fund, Address::insurance_fund())
    }

    /// Move an isolated market's whole collateral pool into the cross pool.
    pub fn transfer_isolated_collateral_to_cross(&mut self, perpetual_id: u32) -> LedgerResult<()> {
        self.markets.get_perpetual(perpetual_id)?;
        let pool = Address::isolated_collateral_pool(perpetual_id);
        self.sweep(pool, Address::cross_collateral_pool())
    }

    fn sweep(&mut self, from: Address, to: Address) -> LedgerResult<()> {
        let balance = self.bank.balance(&from);
        if !balance.is_positive() {
            return Ok(());
        }
        self.send_all(&[PoolTransfer {
            from,
            to,
            quantums: balance.clone(),
        }])?;
        info!(from = %from, to = %to, quantums = %balance, "Balance swept");
        Ok(())
    }
}
