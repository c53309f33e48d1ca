//! Live Swap event listener
//!
//! Each event is resolved to its receipt and block, then queued. Anything
//! that can't be resolved is dropped; the historical sync picks it up later.

use alloy_primitives::{Address, B256};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::chain::{ChainError, ChainSource, SwapEvent};
use crate::config::{Config, ConfigError};
use crate::queue::{JobId, RetryPolicy, TransactionQueue};
use crate::types::TransactionDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    MissingHash,
    ReceiptNotFound,
    Pending,
    BlockNotFound,
    LookupFailed,
    EnqueueFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Enqueued(JobId),
    Discarded(DiscardReason),
}

pub struct SwapListener {
    pool: Address,
    chain: Arc<dyn ChainSource>,
    queue: TransactionQueue,
    policy: RetryPolicy,
}

impl SwapListener {
    /// Fails fast when the RPC endpoint or pool address isn't configured.
    pub fn new(
        config: &Config,
        chain: Arc<dyn ChainSource>,
        queue: TransactionQueue,
    ) -> Result<Self, ConfigError> {
        config.require_rpc_url()?;
        let pool = config.require_pool_address()?;

        Ok(Self {
            pool,
            chain,
            queue,
            policy: RetryPolicy::exponential(config.job_attempts, config.job_backoff()),
        })
    }

    pub fn pool(&self) -> Address {
        self.pool
    }

    pub async fn handle_event(&self, event: SwapEvent) -> EventOutcome {
        let Some(hash) = event.tx_hash else {
            warn!("⚠️  Swap event without transaction hash (block {:?})", event.block_number);
            return EventOutcome::Discarded(DiscardReason::MissingHash);
        };

        let descriptor = match self.resolve(hash).await {
            Ok(d) => d,
            Err(reason) => return EventOutcome::Discarded(reason),
        };

        match self.queue.enqueue_transaction(descriptor, self.policy).await {
            Ok(id) => {
                info!("📡 Swap {:?} queued as job {}", hash, id);
                EventOutcome::Enqueued(id)
            }
            Err(e) => {
                error!("❌ Failed to queue {:?}: {}", hash, e);
                EventOutcome::Discarded(DiscardReason::EnqueueFailed)
            }
        }
    }

    async fn resolve(&self, hash: B256) -> Result<TransactionDescriptor, DiscardReason> {
        let receipt = match self.chain.receipt(hash).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                warn!("⚠️  Receipt not found for {:?}", hash);
                return Err(DiscardReason::ReceiptNotFound);
            }
            Err(e) => {
                warn!("⚠️  Receipt lookup failed for {:?}: {}", hash, e);
                return Err(DiscardReason::LookupFailed);
            }
        };

        let Some(block_number) = receipt.block_number else {
            warn!("⚠️  Receipt for {:?} has no block yet", hash);
            return Err(DiscardReason::Pending);
        };

        let timestamp = match self.chain.block_timestamp(block_number).await {
            Ok(Some(ts)) => ts,
            Ok(None) => {
                warn!("⚠️  Block {} not found for {:?}", block_number, hash);
                return Err(DiscardReason::BlockNotFound);
            }
            Err(e) => {
                warn!("⚠️  Block lookup failed for {}: {}", block_number, e);
                return Err(DiscardReason::LookupFailed);
            }
        };

        Ok(TransactionDescriptor {
            hash: format!("{:?}", receipt.hash),
            block_number,
            timestamp,
            gas_used: receipt.gas_used.to_string(),
            gas_price: Some(receipt.effective_gas_price.to_string()),
        })
    }

    /// Consume events until stopped or until the stream ends.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), ChainError> {
        let mut events = self.chain.swap_events(self.pool).await?;

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("🛑 Listener stopped");
                    return Ok(());
                }
                next = events.next() => match next {
                    Some(event) => {
                        debug!("Swap event in block {:?}", event.block_number);
                        match self.handle_event(event).await {
                            EventOutcome::Enqueued(id) => debug!("Handed off job {}", id),
                            EventOutcome::Discarded(reason) => debug!("Dropped swap event: {:?}", reason),
                        }
                    }
                    None => {
                        error!("❌ Swap event stream closed");
                        return Err(ChainError::StreamClosed);
                    }
                },
            }
        }
    }

    pub fn start(self) -> ListenerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(stop_rx).await });

        ListenerHandle { stop_tx, task }
    }
}

pub struct ListenerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), ChainError>>,
}

impl ListenerHandle {
    pub async fn stop(mut self) -> Result<(), ChainError> {
        let _ = self.stop_tx.send(true);
        self.wait().await
    }

    /// Wait for the listener to exit on its own. Call at most once.
    pub async fn wait(&mut self) -> Result<(), ChainError> {
        (&mut self.task)
            .await
            .map_err(|e| ChainError::Rpc(format!("listener task panicked: {}", e)))?
    }
}
