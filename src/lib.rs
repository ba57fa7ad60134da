//! # Subaccount Ledger
//!
//! Deterministic collateral accounting for perpetual-futures subaccounts.
//!
//! ## Architecture
//!
//! - `types`: subaccounts, updates, markets, results, events and errors
//! - `risk`: net collateral and margin requirements, funding and yield settlement
//! - `ledger`: the update pipeline, isolated markets, safety heaps, negative-TNC gating
//! - `store`: byte-keyed storage with in-memory, branch and SQLite backends
//! - `external`: market registry, bank and event sink interfaces
//! - `config`: Configuration management and validation
//! - `utils`: Shared utilities and fixed-point arithmetic

pub mod config;
pub mod external;
pub mod ledger;
pub mod risk;
pub mod store;
pub mod types;
pub mod utils;

pub use config::Config;
pub use ledger::{BatchOutcome, BlockContext, Ledger};
