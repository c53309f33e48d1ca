//! In-memory store with the same uniqueness contract as the Postgres table

use async_trait::async_trait;
use std::sync::Mutex;

use super::{
    FeeSummary, InsertOutcome, StoreError, TransactionPage, TransactionQuery, TransactionStore,
};
use crate::types::TransactionRecord;

#[derive(Default)]
pub struct MemoryStore {
    /// Insertion order stands in for the serial id
    records: Mutex<Vec<TransactionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn count_hash(&self, hash: &str) -> usize {
        self.records
            .lock()
            .map(|r| r.iter().filter(|rec| rec.hash == hash).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<TransactionRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::InvalidRow("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<InsertOutcome, StoreError> {
        let mut records = self.lock()?;
        if records.iter().any(|r| r.hash == record.hash) {
            return Ok(InsertOutcome::Duplicate);
        }
        records.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn transactions(&self, query: &TransactionQuery) -> Result<TransactionPage, StoreError> {
        let records = self.lock()?;
        let mut matching: Vec<(usize, &TransactionRecord)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| query.matches(r))
            .collect();
        matching.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp).then(b.0.cmp(&a.0)));

        let total_count = matching.len() as u64;
        let transactions = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.page_size() as usize)
            .map(|(_, r)| r.clone())
            .collect();

        Ok(TransactionPage {
            current_page: query.page(),
            page_size: query.page_size(),
            total_count,
            transactions,
        })
    }

    async fn summary(&self) -> Result<FeeSummary, StoreError> {
        let records = self.lock()?;
        Ok(records.iter().fold(FeeSummary::default(), |mut acc, r| {
            acc.total_eth_fee += r.eth_fee.unwrap_or_default();
            acc.total_usdt_fee += r.usdt_fee.unwrap_or_default();
            acc
        }))
    }
}
