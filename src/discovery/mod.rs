//! Transaction discovery
//!
//! Responsible for:
//! - Watching the pool's Swap events and queueing each transaction
//! - Backfilling block ranges from the Etherscan history API
//! - Collapsing duplicate hashes within a backfill batch
//!
//! The two sources overlap freely; storage uniqueness reconciles them.

pub mod chain;
mod dedup;
pub mod etherscan;
mod listener;
mod sync;

pub use chain::AlloyChainSource;
pub use etherscan::EtherscanClient;
pub use listener::{ListenerHandle, SwapListener};
pub use sync::{HistoricalSync, SyncReport};

#[cfg(test)]
pub use chain::{ChainError, ChainSource, ReceiptInfo, SwapEvent};
#[cfg(test)]
pub use etherscan::{HistoryError, HistorySource, TokenTransaction};
