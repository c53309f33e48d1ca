//! Transaction record storage
//!
//! The unique constraint on `hash` is what makes at-least-once delivery
//! safe: inserting a hash twice is reported as `Duplicate`, never an error.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::types::TransactionRecord;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored row is invalid: {0}")]
    InvalidRow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with this hash already existed; nothing was written
    Duplicate,
}

/// Filters and pagination for listing records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionQuery {
    /// Inclusive lower bound, Unix seconds
    pub start_timestamp: Option<u64>,
    /// Inclusive upper bound, Unix seconds
    pub end_timestamp: Option<u64>,
    pub hash: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl TransactionQuery {
    /// 1-based page number
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u64 {
        (self.page() as u64 - 1) * self.page_size() as u64
    }

    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.start_timestamp.map_or(true, |start| record.timestamp >= start)
            && self.end_timestamp.map_or(true, |end| record.timestamp <= end)
            && self.hash.as_deref().map_or(true, |hash| record.hash == hash)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub current_page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeeSummary {
    pub total_eth_fee: Decimal,
    pub total_usdt_fee: Decimal,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert the record unless its hash is already stored.
    async fn insert(&self, record: &TransactionRecord) -> Result<InsertOutcome, StoreError>;

    /// Matching records, newest first, with the total match count.
    async fn transactions(&self, query: &TransactionQuery) -> Result<TransactionPage, StoreError>;

    /// Totals of all stored fees; zero when empty.
    async fn summary(&self) -> Result<FeeSummary, StoreError>;
}
