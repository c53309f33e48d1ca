//! Historical backfill over a block range

use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use super::dedup::unique_by_hash;
use super::etherscan::{HistoryError, HistorySource};
use crate::queue::{QueueError, RetryPolicy, TransactionQueue};
use crate::types::TransactionDescriptor;

/// Etherscan's per-request ceiling
pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Error)]
enum SyncError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Raw entries fetched, duplicates included
    pub total_synced: u64,
    /// Jobs accepted by the queue
    pub enqueued: u64,
    /// Where the next fetch would have started
    pub next_start_block: u64,
    /// Why the run stopped early, if it did
    pub error: Option<String>,
}

pub struct HistoricalSync {
    history: Arc<dyn HistorySource>,
    queue: TransactionQueue,
    policy: RetryPolicy,
    batch_size: usize,
}

impl HistoricalSync {
    pub fn new(history: Arc<dyn HistorySource>, queue: TransactionQueue, policy: RetryPolicy) -> Self {
        Self {
            history,
            queue,
            policy,
            batch_size: MAX_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Backfill `[start_block, end_block]` and return how many entries were
    /// fetched. Errors end the run early; the partial count is returned.
    pub async fn sync(&self, pool: &str, start_block: u64, end_block: u64) -> u64 {
        self.sync_with_report(pool, start_block, end_block)
            .await
            .total_synced
    }

    pub async fn sync_with_report(&self, pool: &str, start_block: u64, end_block: u64) -> SyncReport {
        let mut report = SyncReport {
            next_start_block: start_block,
            ..Default::default()
        };

        if let Err(e) = self.run(pool, end_block, &mut report).await {
            error!("❌ Error syncing transactions: {}", e);
            report.error = Some(e.to_string());
        }

        info!(
            "✅ Sync complete: {} transactions synced ({} enqueued), ended at block {}",
            report.total_synced, report.enqueued, report.next_start_block
        );
        report
    }

    async fn run(&self, pool: &str, end_block: u64, report: &mut SyncReport) -> Result<(), SyncError> {
        loop {
            info!(
                "🔄 Fetching transactions from block {} to {}...",
                report.next_start_block, end_block
            );

            let batch = self
                .history
                .token_transactions(pool, report.next_start_block, end_block, self.batch_size)
                .await?;

            if batch.is_empty() {
                info!("No more transactions found");
                return Ok(());
            }

            let descriptors: Vec<TransactionDescriptor> = batch
                .iter()
                .filter_map(|tx| match TransactionDescriptor::try_from(tx) {
                    Ok(d) => match d.validate() {
                        Ok(()) => Some(d),
                        Err(e) => {
                            warn!("⚠️  Skipping invalid history entry {}: {}", d.hash, e);
                            None
                        }
                    },
                    Err(e) => {
                        warn!("⚠️  Skipping history entry: {}", e);
                        None
                    }
                })
                .collect();

            for tx in unique_by_hash(descriptors) {
                self.queue.enqueue_transaction(tx, self.policy).await?;
                report.enqueued += 1;
            }

            report.total_synced += batch.len() as u64;

            if batch.len() < self.batch_size {
                return Ok(());
            }

            if let Some(last) = batch.last() {
                report.next_start_block = last.block_number()? + 1;
            }
        }
    }
}
