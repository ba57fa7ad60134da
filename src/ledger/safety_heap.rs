//! Persistent per-(market, side) max-heap of subaccounts ranked by risk.
//!
//! The heap lives entirely in the store: a slot map (index -> id), a reverse
//! map (id -> index) and a length record. Scores are never stored; callers
//! pass a scorer that computes `MMR - NC` from the current state, so the root
//! is always the least collateralized account holding that side of the market.
//! A child moves above its parent only when its score is strictly greater.

use num_bigint::BigInt;
use tracing::{debug, error};

use crate::store::{keys, read_record, write_record, KvStore};
use crate::types::{LedgerError, LedgerResult, PositionSide, SubaccountId};

/// Handle to one heap. Holds no state besides its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyHeap {
    perpetual_id: u32,
    side: PositionSide,
}

impl SafetyHeap {
    pub fn new(perpetual_id: u32, side: PositionSide) -> Self {
        Self { perpetual_id, side }
    }

    pub fn perpetual_id(&self) -> u32 {
        self.perpetual_id
    }

    pub fn side(&self) -> PositionSide {
        self.side
    }

    fn corrupted(&self, reason: impl Into<String>) -> LedgerError {
        let reason = reason.into();
        error!(
            perpetual_id = self.perpetual_id,
            side = %self.side,
            reason = %reason,
            "Safety heap corrupted"
        );
        LedgerError::HeapCorrupted {
            perpetual_id: self.perpetual_id,
            side: self.side,
            reason,
        }
    }

    fn decode_u32(&self, bytes: &[u8], what: &str) -> LedgerResult<u32> {
        let raw: [u8; 4] = bytes
            .try_into()
            .map_err(|_| self.corrupted(format!("{} record has {} bytes", what, bytes.len())))?;
        Ok(u32::from_be_bytes(raw))
    }

    pub fn len<S: KvStore>(&self, store: &S) -> LedgerResult<u32> {
        match store.get(&keys::safety_heap_len(self.perpetual_id, self.side))? {
            Some(bytes) => self.decode_u32(&bytes, "length"),
            None => Ok(0),
        }
    }

    pub fn is_empty<S: KvStore>(&self, store: &S) -> LedgerResult<bool> {
        Ok(self.len(store)? == 0)
    }

    fn set_len<S: KvStore>(&self, store: &mut S, len: u32) -> LedgerResult<()> {
        let key = keys::safety_heap_len(self.perpetual_id, self.side);
        if len == 0 {
            store.delete(&key)?;
        } else {
            store.set(&key, &len.to_be_bytes())?;
        }
        Ok(())
    }

    /// Id stored at `index`, if the slot exists.
    pub fn get<S: KvStore>(&self, store: &S, index: u32) -> LedgerResult<Option<SubaccountId>> {
        read_record(store, &keys::safety_heap_slot(self.perpetual_id, self.side, index))
    }

    fn slot<S: KvStore>(&self, store: &S, index: u32) -> LedgerResult<SubaccountId> {
        self.get(store, index)?
            .ok_or_else(|| self.corrupted(format!("slot {} is empty", index)))
    }

    /// Current slot of `id`, if it is in the heap.
    pub fn index_of<S: KvStore>(&self, store: &S, id: &SubaccountId) -> LedgerResult<Option<u32>> {
        match store.get(&keys::safety_heap_index(self.perpetual_id, self.side, id))? {
            Some(bytes) => Ok(Some(self.decode_u32(&bytes, "index")?)),
            None => Ok(None),
        }
    }

    pub fn contains<S: KvStore>(&self, store: &S, id: &SubaccountId) -> LedgerResult<bool> {
        Ok(self.index_of(store, id)?.is_some())
    }

    /// The riskiest account, if any.
    pub fn peek<S: KvStore>(&self, store: &S) -> LedgerResult<Option<SubaccountId>> {
        if self.is_empty(store)? {
            return Ok(None);
        }
        self.slot(store, 0).map(Some)
    }

    /// Every id in array order.
    pub fn ids<S: KvStore>(&self, store: &S) -> LedgerResult<Vec<SubaccountId>> {
        (0..self.len(store)?).map(|i| self.slot(store, i)).collect()
    }

    fn place<S: KvStore>(&self, store: &mut S, index: u32, id: &SubaccountId) -> LedgerResult<()> {
        write_record(
            store,
            &keys::safety_heap_slot(self.perpetual_id, self.side, index),
            id,
        )?;
        store.set(
            &keys::safety_heap_index(self.perpetual_id, self.side, id),
            &index.to_be_bytes(),
        )?;
        Ok(())
    }

    fn swap<S: KvStore>(&self, store: &mut S, i: u32, j: u32) -> LedgerResult<()> {
        let a = self.slot(store, i)?;
        let b = self.slot(store, j)?;
        self.place(store, i, &b)?;
        self.place(store, j, &a)
    }

    fn score_at<S, F>(&self, store: &S, index: u32, score: &F) -> LedgerResult<BigInt>
    where
        S: KvStore,
        F: Fn(&S, &SubaccountId) -> LedgerResult<BigInt>,
    {
        let id = self.slot(store, index)?;
        score(store, &id)
    }

    fn sift_up<S, F>(&self, store: &mut S, mut index: u32, score: &F) -> LedgerResult<()>
    where
        S: KvStore,
        F: Fn(&S, &SubaccountId) -> LedgerResult<BigInt>,
    {
        if index == 0 {
            return Ok(());
        }
        let moving = self.score_at(store, index, score)?;
        while index > 0 {
            let parent = (index - 1) / 2;
            if moving <= self.score_at(store, parent, score)? {
                break;
            }
            self.swap(store, index, parent)?;
            index = parent;
        }
        Ok(())
    }

    fn sift_down<S, F>(&self, store: &mut S, mut index: u32, score: &F) -> LedgerResult<()>
    where
        S: KvStore,
        F: Fn(&S, &SubaccountId) -> LedgerResult<BigInt>,
    {
        let len = self.len(store)?;
        let moving = self.score_at(store, index, score)?;
        loop {
            let mut top = index;
            let mut top_score = moving.clone();
            for child in [2 * index + 1, 2 * index + 2] {
                if child >= len {
                    continue;
                }
                let child_score = self.score_at(store, child, score)?;
                if child_score > top_score {
                    top = child;
                    top_score = child_score;
                }
            }
            if top == index {
                return Ok(());
            }
            self.swap(store, index, top)?;
            index = top;
        }
    }

    /// Insert `id`, or move it to its correct slot if it is already present.
    pub fn insert<S, F>(&self, store: &mut S, id: &SubaccountId, score: F) -> LedgerResult<()>
    where
        S: KvStore,
        F: Fn(&S, &SubaccountId) -> LedgerResult<BigInt>,
    {
        if let Some(index) = self.index_of(store, id)? {
            self.sift_down(store, index, &score)?;
            if let Some(index) = self.index_of(store, id)? {
                self.sift_up(store, index, &score)?;
            }
            return Ok(());
        }

        let len = self.len(store)?;
        self.place(store, len, id)?;
        self.set_len(store, len + 1)?;
        self.sift_up(store, len, &score)?;
        debug!(
            perpetual_id = self.perpetual_id,
            side = %self.side,
            subaccount = %id,
            "Inserted into safety heap"
        );
        Ok(())
    }

    /// Remove `id`. Returns false when it was not in the heap.
    pub fn remove<S, F>(&self, store: &mut S, id: &SubaccountId, score: F) -> LedgerResult<bool>
    where
        S: KvStore,
        F: Fn(&S, &SubaccountId) -> LedgerResult<BigInt>,
    {
        let Some(index) = self.index_of(store, id)? else {
            return Ok(false);
        };
        let len = self.len(store)?;
        if index >= len {
            return Err(self.corrupted(format!(
                "{} indexed at {} beyond length {}",
                id, index, len
            )));
        }
        let last = len - 1;

        if index != last {
            let moved = self.slot(store, last)?;
            self.place(store, index, &moved)?;
        }
        store.delete(&keys::safety_heap_slot(self.perpetual_id, self.side, last))?;
        store.delete(&keys::safety_heap_index(self.perpetual_id, self.side, id))?;
        self.set_len(store, last)?;

        if index < last {
            self.sift_down(store, index, &score)?;
            self.sift_up(store, index, &score)?;
        }
        debug!(
            perpetual_id = self.perpetual_id,
            side = %self.side,
            subaccount = %id,
            "Removed from safety heap"
        );
        Ok(true)
    }

    /// Check slot/index consistency and heap order against current scores.
    pub fn verify<S, F>(&self, store: &S, score: F) -> LedgerResult<()>
    where
        S: KvStore,
        F: Fn(&S, &SubaccountId) -> LedgerResult<BigInt>,
    {
        let ids = self.ids(store)?;
        let mut scores = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if self.index_of(store, id)? != Some(i as u32) {
                return Err(self.corrupted(format!(
                    "reverse index of {} does not point at {}",
                    id, i
                )));
            }
            scores.push(score(store, id)?);
        }
        for child in 1..scores.len() {
            let parent = (child - 1) / 2;
            if scores[child] > scores[parent] {
                return Err(self.corrupted(format!(
                    "slot {} outranks its parent {}",
                    child, parent
                )));
            }
        }
        Ok(())
    }
}
