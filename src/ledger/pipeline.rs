//! Validation and atomic persistence of update batches.
//!
//! Every update is settled against the pre-batch state and judged on its own.
//! A batch commits only when every update succeeds; then subaccounts and
//! safety heaps are written into a branch, pool movements are simulated
//! against bank balances, and only after all of that succeeded are open
//! interest, bank transfers, the write set and events applied, in that order.

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

use super::isolated::{
    check_isolated_constraints, collateral_pool_of, collateral_pool_transfer, PoolTransfer,
};
use super::open_interest::{
    open_interest_delta, validate_match_updates, OpenInterestBranch, OpenInterestDelta,
};
use super::rebalancer::rebalance_segregated_collateral;
use super::safety_heap::SafetyHeap;
use super::{get_subaccount, set_subaccount, BatchOutcome, BlockContext, Ledger};
use crate::external::{BankKeeper, EventSink, MarketRegistry};
use crate::risk::{risk_for_update, settle_subaccount, update_result, Risk};
use crate::store::{KvStore, StoreBranch};
use crate::types::{
    Address, AssetPosition, LedgerError, LedgerResult, PerpetualPosition, SettledUpdate,
    Subaccount, SubaccountId, SubaccountUpdateEvent, Update, UpdateResult, UpdateType,
    SETTLEMENT_ASSET_ID,
};

/// An update with its settled account and what settlement produced.
struct PreparedUpdate {
    settled: SettledUpdate,
    funding_payments: BTreeMap<u32, BigInt>,
    yield_claimed: BigInt,
}

/// `MMR - NC` of a stored account after settlement.
fn risk_score<S, R>(markets: &R, store: &S, id: &SubaccountId) -> LedgerResult<BigInt>
where
    S: KvStore,
    R: MarketRegistry + ?Sized,
{
    let settled = settle_subaccount(&get_subaccount(store, id)?, markets)?;
    let update = SettledUpdate {
        settled_subaccount: settled.subaccount,
        asset_updates: Vec::new(),
        perpetual_updates: Vec::new(),
    };
    Ok(risk_for_update(&update, markets)?.risk_score())
}

/// Apply an update's deltas to its settled account and rebalance segregated
/// collateral. New positions start at the market's current indices.
fn apply_update<R>(update: &SettledUpdate, markets: &R) -> LedgerResult<Subaccount>
where
    R: MarketRegistry + ?Sized,
{
    let mut subaccount = update.settled_subaccount.clone();
    let mut closed = Vec::new();

    for u in &update.perpetual_updates {
        let existing = subaccount
            .perpetual_positions
            .iter()
            .position(|p| p.perpetual_id == u.perpetual_id);
        match existing {
            Some(i) => {
                subaccount.perpetual_positions[i].quantums += &u.quantums_delta;
                if subaccount.perpetual_positions[i].quantums.is_zero() {
                    closed.push(subaccount.perpetual_positions.remove(i));
                }
            }
            None if !u.quantums_delta.is_zero() => {
                let perpetual = markets.get_perpetual(u.perpetual_id)?;
                subaccount.perpetual_positions.push(PerpetualPosition {
                    perpetual_id: u.perpetual_id,
                    quantums: u.quantums_delta.clone(),
                    funding_index: perpetual.funding_index,
                    yield_index: perpetual.yield_index,
                    quote_balance: BigInt::zero(),
                });
            }
            None => {}
        }
    }
    subaccount.perpetual_positions.sort_by_key(|p| p.perpetual_id);

    for u in &update.asset_updates {
        if u.asset_id != SETTLEMENT_ASSET_ID {
            return Err(LedgerError::AssetNotSupported(u.asset_id));
        }
        let balance = subaccount.settlement_balance() + &u.quantums_delta;
        subaccount.set_settlement_balance(balance);
    }

    rebalance_segregated_collateral(&mut subaccount, &closed, markets)?;
    Ok(subaccount)
}

/// Check every transfer against the balances left by the ones before it.
pub(super) fn simulate_transfers<B>(bank: &B, transfers: &[PoolTransfer]) -> LedgerResult<()>
where
    B: BankKeeper + ?Sized,
{
    let mut balances: BTreeMap<Address, BigInt> = BTreeMap::new();
    for t in transfers {
        let from = balances
            .entry(t.from)
            .or_insert_with(|| bank.balance(&t.from));
        if *from < t.quantums {
            error!(
                pool = %t.from,
                balance = %from,
                needed = %t.quantums,
                "Collateral pool cannot cover batch"
            );
            return Err(LedgerError::InsufficientFunds {
                address: t.from,
                balance: from.clone(),
                needed: t.quantums.clone(),
            });
        }
        *from -= &t.quantums;
        *balances
            .entry(t.to)
            .or_insert_with(|| bank.balance(&t.to)) += &t.quantums;
    }
    Ok(())
}

impl<R, B, E> Ledger<R, B, E>
where
    R: MarketRegistry,
    B: BankKeeper,
    E: EventSink,
{
    fn prepare_updates<S: KvStore>(
        &self,
        store: &S,
        updates: &[Update],
    ) -> LedgerResult<Vec<PreparedUpdate>> {
        updates
            .iter()
            .map(|u| -> LedgerResult<PreparedUpdate> {
                u.ensure_unique_positions()?;
                let stored = get_subaccount(store, &u.subaccount_id)?;
                let settled = settle_subaccount(&stored, &self.markets)?;
                Ok(PreparedUpdate {
                    settled: SettledUpdate {
                        settled_subaccount: settled.subaccount,
                        asset_updates: u.asset_updates.clone(),
                        perpetual_updates: u.perpetual_updates.clone(),
                    },
                    funding_payments: settled.funding_payments,
                    yield_claimed: settled.yield_claimed,
                })
            })
            .collect()
    }

    fn check_updatable(&self, update: &SettledUpdate) -> LedgerResult<()> {
        for u in &update.perpetual_updates {
            if !self.markets.get_perpetual(u.perpetual_id)?.is_updatable() {
                return Err(LedgerError::PositionNotUpdatable {
                    subaccount: update.settled_subaccount.id.clone(),
                    perpetual_id: u.perpetual_id,
                });
            }
        }
        for u in &update.asset_updates {
            if u.asset_id != SETTLEMENT_ASSET_ID {
                return Err(LedgerError::AssetNotSupported(u.asset_id));
            }
        }
        Ok(())
    }

    fn internal_can_update<S: KvStore>(
        &self,
        store: &S,
        ctx: &BlockContext,
        updates: &[SettledUpdate],
        update_type: UpdateType,
    ) -> LedgerResult<BatchOutcome> {
        if update_type == UpdateType::Match {
            validate_match_updates(updates)?;
        }

        let (isolated_ok, isolated_results) = check_isolated_constraints(updates, &self.markets)?;
        if !isolated_ok {
            return Ok(BatchOutcome::from_results(isolated_results));
        }

        if update_type.is_gated() {
            let pools = updates
                .iter()
                .map(|u| collateral_pool_of(&u.settled_subaccount, &self.markets))
                .collect::<LedgerResult<Vec<_>>>()?;
            if self.gate().check(store, ctx, &pools)? {
                return Ok(BatchOutcome::uniform(
                    UpdateResult::WithdrawalsAndTransfersBlocked,
                    updates.len(),
                ));
            }
        }

        // New requirements see the open interest a match leaves behind.
        let oi_delta = open_interest_delta(updates, update_type)?;
        let mut branched = OpenInterestBranch::new(&self.markets);
        if let Some(delta) = &oi_delta {
            branched.modify_open_interest(delta.perpetual_id, &delta.base_quantums)?;
        }

        let mut current: BTreeMap<SubaccountId, Risk> = BTreeMap::new();
        let mut results = Vec::with_capacity(updates.len());
        for u in updates {
            self.check_updatable(u)?;

            let new = risk_for_update(u, &branched)?;
            if new.is_initial_collateralized() {
                results.push(UpdateResult::Success);
                continue;
            }

            let id = &u.settled_subaccount.id;
            let cur = match current.get(id) {
                Some(risk) => risk.clone(),
                None => {
                    let risk = risk_for_update(&u.without_deltas(), &self.markets)?;
                    current.insert(id.clone(), risk.clone());
                    risk
                }
            };
            let result = update_result(&cur, &new);
            if !result.is_success() {
                info!(
                    subaccount = %id,
                    result = %result,
                    nc = %new.nc,
                    imr = %new.imr,
                    mmr = %new.mmr,
                    "Update rejected"
                );
            }
            results.push(result);
        }

        let mut outcome = BatchOutcome::from_results(results);
        outcome.open_interest_delta = oi_delta;
        Ok(outcome)
    }

    /// Validate a batch without persisting anything. The same subaccount may
    /// appear more than once; each update is judged on its own.
    pub fn can_update_subaccounts<S: KvStore>(
        &self,
        store: &S,
        ctx: &BlockContext,
        updates: &[Update],
        update_type: UpdateType,
    ) -> LedgerResult<BatchOutcome> {
        let settled: Vec<SettledUpdate> = self
            .prepare_updates(store, updates)?
            .into_iter()
            .map(|p| p.settled)
            .collect();
        self.internal_can_update(store, ctx, &settled, update_type)
    }

    /// Net collateral and margin requirements of a subaccount as if `update`
    /// were applied to its settled state.
    pub fn get_net_collateral_and_margin_requirements<S: KvStore>(
        &self,
        store: &S,
        update: &Update,
    ) -> LedgerResult<Risk> {
        update.ensure_unique_positions()?;
        let stored = get_subaccount(store, &update.subaccount_id)?;
        let settled = settle_subaccount(&stored, &self.markets)?;
        risk_for_update(
            &SettledUpdate {
                settled_subaccount: settled.subaccount,
                asset_updates: update.asset_updates.clone(),
                perpetual_updates: update.perpetual_updates.clone(),
            },
            &self.markets,
        )
    }

    /// Validate and, if every update succeeds, persist a batch atomically.
    pub fn update_subaccounts<S: KvStore>(
        &mut self,
        store: &mut S,
        ctx: &BlockContext,
        updates: &[Update],
        update_type: UpdateType,
    ) -> LedgerResult<BatchOutcome> {
        self.update_subaccounts_with_transfers(store, ctx, updates, update_type, &[])
    }

    /// `update_subaccounts`, moving `external` tokens together with the
    /// batch's own pool movements once every check has passed.
    pub(super) fn update_subaccounts_with_transfers<S: KvStore>(
        &mut self,
        store: &mut S,
        ctx: &BlockContext,
        updates: &[Update],
        update_type: UpdateType,
        external: &[PoolTransfer],
    ) -> LedgerResult<BatchOutcome> {
        let mut targets = BTreeSet::new();
        for u in updates {
            if !targets.insert(&u.subaccount_id) {
                return Err(LedgerError::NonUniqueSubaccountUpdates(u.subaccount_id.clone()));
            }
        }

        let prepared = self.prepare_updates(store, updates)?;
        let settled: Vec<SettledUpdate> = prepared.iter().map(|p| p.settled.clone()).collect();

        let outcome = self.internal_can_update(store, ctx, &settled, update_type)?;
        if !outcome.success {
            info!(
                update_type = %update_type,
                results = ?outcome.results,
                "Batch rejected"
            );
            return Ok(outcome);
        }

        let mut after = Vec::with_capacity(prepared.len());
        let mut transfers = external.to_vec();
        for p in &prepared {
            let updated = apply_update(&p.settled, &self.markets)?;
            transfers.extend(self.settlement_transfers(p, &updated)?);
            after.push(updated);
        }

        self.commit(
            store,
            &prepared,
            &after,
            &transfers,
            outcome.open_interest_delta.as_ref(),
        )?;
        debug!(
            update_type = %update_type,
            updates = updates.len(),
            transfers = transfers.len(),
            "Batch committed"
        );
        Ok(outcome)
    }

    /// Pool movements backing an applied update: claimed yield, then the
    /// move between pools when an isolated position opens or closes.
    fn settlement_transfers(
        &self,
        prepared: &PreparedUpdate,
        updated: &Subaccount,
    ) -> LedgerResult<Vec<PoolTransfer>> {
        let before = &prepared.settled.settled_subaccount;
        let mut transfers = Vec::new();
        if !prepared.yield_claimed.is_zero() {
            let pool = collateral_pool_of(before, &self.markets)?;
            let (from, to) = if prepared.yield_claimed.is_positive() {
                (Address::yield_pool(), pool)
            } else {
                (pool, Address::yield_pool())
            };
            transfers.push(PoolTransfer {
                from,
                to,
                quantums: prepared.yield_claimed.abs(),
            });
        }
        if let Some(t) = collateral_pool_transfer(before, updated, &self.markets)? {
            transfers.push(t);
        }
        Ok(transfers)
    }

    /// Persist applied updates. Fallible work (transfer simulation and the
    /// branch write set) happens first; then open interest, bank transfers,
    /// the write set and events are applied in that order.
    fn commit<S: KvStore>(
        &mut self,
        store: &mut S,
        prepared: &[PreparedUpdate],
        after: &[Subaccount],
        transfers: &[PoolTransfer],
        oi_delta: Option<&OpenInterestDelta>,
    ) -> LedgerResult<()> {
        simulate_transfers(&self.bank, transfers)?;

        let write_set = {
            let mut branch = StoreBranch::new(&*store);
            for subaccount in after {
                set_subaccount(&mut branch, subaccount)?;
            }
            let markets = &self.markets;
            for (p, updated) in prepared.iter().zip(after) {
                let id = &updated.id;
                for position in &p.settled.settled_subaccount.perpetual_positions {
                    SafetyHeap::new(position.perpetual_id, position.side())
                        .remove(&mut branch, id, |s, id| risk_score(markets, s, id))?;
                }
                for position in &updated.perpetual_positions {
                    SafetyHeap::new(position.perpetual_id, position.side())
                        .insert(&mut branch, id, |s, id| risk_score(markets, s, id))?;
                }
            }
            branch.into_write_set()
        };

        if let Some(delta) = oi_delta {
            self.markets
                .modify_open_interest(delta.perpetual_id, &delta.base_quantums)?;
        }
        for t in transfers {
            self.bank.send(&t.from, &t.to, &t.quantums)?;
        }
        let writes = write_set.len();
        store.apply(write_set)?;
        debug!(writes, "Write set applied");

        for (p, updated) in prepared.iter().zip(after) {
            if let Some(event) = self.update_event(p, updated)? {
                self.events.emit(event);
            }
        }
        Ok(())
    }

    /// Claim an account's accrued funding and yield outside of any update.
    ///
    /// Yield beyond what the yield pool holds is forfeited. Returns the net
    /// yield credited to the main balance.
    pub fn claim_yield_for_subaccount<S: KvStore>(
        &mut self,
        store: &mut S,
        id: &SubaccountId,
    ) -> LedgerResult<BigInt> {
        let stored = get_subaccount(store, id)?;
        if stored.is_empty() {
            return Err(LedgerError::NoYieldToClaim(id.clone()));
        }

        let settled = settle_subaccount(&stored, &self.markets)?;
        let mut prepared = PreparedUpdate {
            settled: SettledUpdate {
                settled_subaccount: settled.subaccount,
                asset_updates: Vec::new(),
                perpetual_updates: Vec::new(),
            },
            funding_payments: settled.funding_payments,
            yield_claimed: settled.yield_claimed,
        };

        let available = self.bank.balance(&Address::yield_pool());
        if prepared.yield_claimed > available {
            let forfeited = &prepared.yield_claimed - &available;
            warn!(
                subaccount = %id,
                claimed = %prepared.yield_claimed,
                available = %available,
                "Yield pool short, claiming what is available"
            );
            let subaccount = &mut prepared.settled.settled_subaccount;
            let balance = subaccount.settlement_balance() - forfeited;
            subaccount.set_settlement_balance(balance);
            prepared.yield_claimed = available;
        }

        let updated = apply_update(&prepared.settled, &self.markets)?;
        let transfers = self.settlement_transfers(&prepared, &updated)?;
        let claimed = prepared.yield_claimed.clone();
        self.commit(store, &[prepared], &[updated], &transfers, None)?;
        info!(subaccount = %id, claimed = %claimed, "Yield claimed");
        Ok(claimed)
    }

    fn update_event(
        &self,
        prepared: &PreparedUpdate,
        updated: &Subaccount,
    ) -> LedgerResult<Option<SubaccountUpdateEvent>> {
        let settled = &prepared.settled;
        if settled.asset_updates.is_empty()
            && settled.perpetual_updates.is_empty()
            && prepared.funding_payments.is_empty()
            && prepared.yield_claimed.is_zero()
        {
            return Ok(None);
        }

        let perpetual_ids: BTreeSet<u32> = settled
            .perpetual_updates
            .iter()
            .map(|u| u.perpetual_id)
            .chain(prepared.funding_payments.keys().copied())
            .collect();
        let mut updated_perpetual_positions = Vec::with_capacity(perpetual_ids.len());
        for id in perpetual_ids {
            let position = match updated.perpetual_position(id) {
                Some(p) => p.clone(),
                None => {
                    let perpetual = self.markets.get_perpetual(id)?;
                    PerpetualPosition {
                        perpetual_id: id,
                        quantums: BigInt::zero(),
                        funding_index: perpetual.funding_index,
                        yield_index: perpetual.yield_index,
                        quote_balance: BigInt::zero(),
                    }
                }
            };
            updated_perpetual_positions.push(position);
        }

        let mut asset_ids: BTreeSet<u32> =
            settled.asset_updates.iter().map(|u| u.asset_id).collect();
        if !prepared.yield_claimed.is_zero() {
            asset_ids.insert(SETTLEMENT_ASSET_ID);
        }
        let updated_asset_positions = asset_ids
            .into_iter()
            .map(|asset_id| AssetPosition {
                asset_id,
                quantums: if asset_id == SETTLEMENT_ASSET_ID {
                    updated.settlement_balance()
                } else {
                    BigInt::zero()
                },
            })
            .collect();

        Ok(Some(SubaccountUpdateEvent {
            subaccount_id: updated.id.clone(),
            updated_perpetual_positions,
            updated_asset_positions,
            funding_payments: prepared.funding_payments.clone(),
            yield_index: updated.asset_yield_index.clone(),
        }))
    }
}
