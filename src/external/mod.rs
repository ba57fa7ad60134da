//! External collaborators: market registry, bank, event sink.

pub mod memory;
pub mod traits;

pub use memory::{InMemoryBank, InMemoryMarkets, RecordingEventSink};
pub use traits::{BankKeeper, EventSink, MarketRegistry};

#[cfg(test)]
pub use traits::{MockBankKeeper, MockEventSink, MockMarketRegistry};
