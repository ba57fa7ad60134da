//! Core data types shared by the ledger.

pub mod error;
pub mod event;
pub mod market;
pub mod subaccount;
pub mod update;

pub use error::{LedgerError, LedgerResult, StoreError};
pub use event::SubaccountUpdateEvent;
pub use market::{
    Address, LiquidityTier, MarketType, PerpetualInfo, QUOTE_ATOMIC_RESOLUTION,
};
pub use subaccount::{
    AssetPosition, PerpetualPosition, PositionSide, Subaccount, SubaccountId,
    SETTLEMENT_ASSET_ID, ZERO_YIELD_INDEX,
};
pub use update::{
    AssetUpdate, PerpetualUpdate, SettledUpdate, Update, UpdateResult, UpdateType,
};
