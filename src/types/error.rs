//! Fatal error taxonomy.
//!
//! Anything here aborts the whole batch and leaves state untouched. Ordinary
//! account-level risk outcomes are `UpdateResult`s, not errors.

use num_bigint::BigInt;
use thiserror::Error;

use super::market::Address;
use super::subaccount::{PositionSide, SubaccountId};

/// Failures of the key-value store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupted record at key {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("perpetual {0} does not exist")]
    PerpetualDoesNotExist(u32),

    #[error("asset {0} is not supported")]
    AssetNotSupported(u32),

    #[error("position in perpetual {perpetual_id} of {subaccount} is not updatable")]
    PositionNotUpdatable {
        subaccount: SubaccountId,
        perpetual_id: u32,
    },

    #[error("{subaccount} has more than one {kind} update for id {id}")]
    NonUniquePositionUpdates {
        subaccount: SubaccountId,
        kind: &'static str,
        id: u32,
    },

    #[error("{0} is updated more than once in the batch")]
    NonUniqueSubaccountUpdates(SubaccountId),

    #[error("invalid match updates: {0}")]
    InvalidMatchUpdates(String),

    #[error("malformed yield index {0:?}")]
    MalformedYieldIndex(String),

    #[error("yield index decreased from {previous} to {current}")]
    YieldIndexDecreased { previous: String, current: String },

    #[error("negative TNC block for pool {pool} cannot move back from {stored} to {requested}")]
    NegativeTncBlockRegression {
        pool: Address,
        stored: u32,
        requested: u32,
    },

    #[error("current block {current} is before the last negative TNC block {marker}")]
    BlockBeforeMarker { current: u32, marker: u32 },

    #[error("insufficient funds at {address}: balance {balance}, needed {needed}")]
    InsufficientFunds {
        address: Address,
        balance: BigInt,
        needed: BigInt,
    },

    #[error("transfer amount must be positive, got {0}")]
    TransferQuantumsNotPositive(BigInt),

    #[error("yield deposit must not be negative, got {0}")]
    NegativeYieldDeposit(BigInt),

    #[error("{0} has no positions to claim yield for")]
    NoYieldToClaim(SubaccountId),

    #[error("builder fee must not be negative, got {0}")]
    NegativeBuilderFee(BigInt),

    #[error("revenue shares {shared} exceed total fees {total}")]
    RevenueSharesExceedFees { total: BigInt, shared: BigInt },

    #[error("update of {subaccount} rejected: {result}")]
    UpdateRejected {
        subaccount: SubaccountId,
        result: super::update::UpdateResult,
    },

    #[error("open interest of perpetual {perpetual_id} would become negative")]
    OpenInterest { perpetual_id: u32 },

    #[error("safety heap ({perpetual_id}, {side}) is corrupted: {reason}")]
    HeapCorrupted {
        perpetual_id: u32,
        side: PositionSide,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
