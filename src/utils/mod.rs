//! Shared utilities: fixed-point quantum arithmetic and serde adapters.

pub mod bigint_str;
pub mod decimal;
