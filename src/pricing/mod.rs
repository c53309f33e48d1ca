//! Price enrichment
//!
//! Responsible for:
//! - Caching point-in-time prices by (symbol, second)
//! - Fetching misses from the Binance klines API
//! - Respecting the API's weight budget and throttling responses

pub mod binance;
pub mod cache;
mod resolver;

pub use binance::BinanceClient;
#[cfg(test)]
pub use binance::{KlineRequest, KlineResponse, SpotPriceApi};
pub use cache::{MemoryPriceCache, PriceCache, RedisPriceCache};
pub use resolver::{PriceResolver, PriceSettings};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price API rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("upstream price unavailable for {symbol} at {timestamp}")]
    Unavailable { symbol: String, timestamp: u64 },

    #[error("price API returned HTTP {status}")]
    Upstream { status: u16 },

    #[error("price API request failed: {0}")]
    Http(String),

    #[error("invalid price value {0:?}")]
    InvalidPrice(String),

    #[error("price cache error: {0}")]
    Cache(String),
}

impl PriceError {
    /// Whether a later attempt may succeed. A malformed or non-positive
    /// price is terminal; everything else is left to the queue's backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PriceError::InvalidPrice(_))
    }
}
