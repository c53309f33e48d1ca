//! Transaction worker
//!
//! Claims jobs from the queue, prices them at block time and persists the
//! record. Every failure goes back to the queue; there is no retry loop here.
//! Terminal failures (an unparseable price, fee math that can't succeed) are
//! failed at once instead of burning the remaining attempts.
//!
//! Responsible for:
//! - N concurrent job loops
//! - Extending the lock of an in-flight job
//! - Periodic stalled-job recovery
//! - Lifecycle events (completed / failed / error) for logging

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::pricing::{PriceError, PriceResolver};
use crate::queue::{FailureDisposition, Job, JobId, JobPayload, QueueError, TransactionQueue};
use crate::storage::{InsertOutcome, StoreError, TransactionStore};
use crate::types::{FeeError, TransactionRecord};

/// Wait between polls when the queue is empty
const IDLE_POLL: Duration = Duration::from_millis(500);

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Price(#[from] PriceError),

    #[error(transparent)]
    Fee(#[from] FeeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// Terminal errors skip the rest of the job's attempt budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Price(e) => e.is_retryable(),
            // Same inputs, same result
            WorkerError::Fee(_) => false,
            WorkerError::Store(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Completed {
        job_id: JobId,
        subject: String,
        outcome: InsertOutcome,
    },
    Failed {
        job_id: JobId,
        subject: String,
        reason: String,
        disposition: FailureDisposition,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub lock_duration: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    pub idle_poll: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            lock_duration: Duration::from_secs(config.lock_duration_secs),
            stalled_interval: Duration::from_secs(config.stalled_interval_secs),
            max_stalled_count: config.max_stalled_count,
            idle_poll: IDLE_POLL,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct TransactionWorker {
    queue: TransactionQueue,
    resolver: Arc<PriceResolver>,
    store: Arc<dyn TransactionStore>,
    settings: WorkerSettings,
    events: broadcast::Sender<WorkerEvent>,
}

impl TransactionWorker {
    pub fn new(
        queue: TransactionQueue,
        resolver: Arc<PriceResolver>,
        store: Arc<dyn TransactionStore>,
        settings: WorkerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue,
            resolver,
            store,
            settings,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Price, annotate and store one payload. Safe to repeat.
    pub async fn process(&self, payload: &JobPayload) -> Result<InsertOutcome, WorkerError> {
        match payload {
            JobPayload::RecordTransaction(tx) => {
                let price = self.resolver.price_at(tx.timestamp).await?;
                let record = TransactionRecord::enrich(tx.clone(), price, Utc::now())?;
                Ok(self.store.insert(&record).await?)
            }
        }
    }

    /// Claim and handle a single job. Returns false when none was ready.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(job) = self.queue.claim(self.settings.lock_duration).await? else {
            return Ok(false);
        };

        let subject = job.payload.subject().to_string();
        debug!("⚙️  Processing job {} ({})", job.id, subject);

        match self.process_locked(&job).await {
            Ok(outcome) => {
                if !self.queue.complete(&job).await? {
                    warn!("⏳ Job {} ({}) lost its lock before completing", job.id, subject);
                }
                self.emit(WorkerEvent::Completed {
                    job_id: job.id,
                    subject,
                    outcome,
                });
            }
            Err(e) => {
                let reason = e.to_string();
                let disposition = if e.is_retryable() {
                    self.queue.fail_attempt(&job, &reason).await?
                } else {
                    self.queue.fail_permanently(&job, &reason).await?
                };
                self.emit(WorkerEvent::Failed {
                    job_id: job.id,
                    subject,
                    reason,
                    disposition,
                });
            }
        }

        Ok(true)
    }

    /// Run `process` while renewing the job lock at half its duration.
    async fn process_locked(&self, job: &Job) -> Result<InsertOutcome, WorkerError> {
        let lock = self.settings.lock_duration;
        let mut heartbeat = interval((lock / 2).max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let work = self.process(&job.payload);
        tokio::pin!(work);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => match self.queue.extend_lock(job.id, lock).await {
                    Ok(true) => {}
                    Ok(false) => warn!("⏳ Job {} is no longer active", job.id),
                    Err(e) => warn!("⚠️  Failed to extend lock of job {}: {}", job.id, e),
                },
            }
        }
    }

    async fn job_loop(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("Worker loop {} started", index);

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let idle = match self.run_once().await {
                Ok(true) => false,
                Ok(false) => true,
                Err(e) => {
                    self.emit(WorkerEvent::Error {
                        message: e.to_string(),
                    });
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = sleep(self.settings.idle_poll) => {}
                }
            }
        }

        debug!("Worker loop {} stopped", index);
    }

    async fn stall_checker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.stalled_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    match self.queue.recover_stalled(self.settings.max_stalled_count).await {
                        Ok(report) if report.requeued + report.failed > 0 => {
                            info!(
                                "🔁 Stall check: {} requeued, {} failed",
                                report.requeued, report.failed
                            );
                        }
                        Ok(_) => {}
                        Err(e) => self.emit(WorkerEvent::Error { message: e.to_string() }),
                    }
                }
            }
        }
    }

    /// Spawn the job loops, the stall checker and the event logger.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.settings.concurrency + 2);

        tasks.push(tokio::spawn(log_events(self.subscribe(), shutdown_rx.clone())));
        tasks.push(tokio::spawn(self.clone().stall_checker(shutdown_rx.clone())));
        for index in 0..self.settings.concurrency {
            tasks.push(tokio::spawn(self.clone().job_loop(index, shutdown_rx.clone())));
        }

        info!(
            "👷 Worker started on {} ({} concurrent)",
            self.queue.name(),
            self.settings.concurrency
        );

        WorkerHandle { shutdown_tx, tasks }
    }
}

async fn log_events(mut events: broadcast::Receiver<WorkerEvent>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = events.recv() => event,
        };

        match event {
            Ok(WorkerEvent::Completed { job_id, subject, outcome }) => match outcome {
                InsertOutcome::Inserted => info!("✅ Job {} completed: stored {}", job_id, subject),
                InsertOutcome::Duplicate => info!("✅ Job {} completed: {} already stored", job_id, subject),
            },
            Ok(WorkerEvent::Failed { job_id, subject, reason, disposition }) => match disposition {
                FailureDisposition::Retrying { attempt, delay } => warn!(
                    "🔁 Job {} ({}) failed attempt {}: {} (retry in {:?})",
                    job_id, subject, attempt, reason, delay
                ),
                FailureDisposition::Exhausted { attempts } => error!(
                    "💀 Job {} ({}) failed after {} attempts: {}",
                    job_id, subject, attempts, reason
                ),
                FailureDisposition::Lost => warn!(
                    "⏳ Job {} ({}) failed after losing its lock: {}",
                    job_id, subject, reason
                ),
            },
            Ok(WorkerEvent::Error { message }) => error!("❌ Worker error: {}", message),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Event logger skipped {} events", n),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Let in-flight jobs finish, then stop every task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("🛑 Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{HistoricalSync, SwapEvent, SwapListener};
    use crate::pricing::{KlineResponse, MemoryPriceCache, PriceSettings};
    use crate::queue::RetryPolicy;
    use crate::storage::MemoryStore;
    use crate::testing::{descriptor, kline_response, test_config, token_tx, MockChainSource, MockHistorySource, MockSpotApi};
    use alloy_primitives::{b256, B256};
    use tokio_test::assert_ok;

    const LOCK: Duration = Duration::from_secs(30);

    struct Harness {
        queue: TransactionQueue,
        store: Arc<MemoryStore>,
        api: Arc<MockSpotApi>,
        worker: Arc<TransactionWorker>,
    }

    fn harness(responses: Vec<KlineResponse>) -> Harness {
        let queue = TransactionQueue::in_memory();
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(MockSpotApi::with(responses));
        let resolver = Arc::new(PriceResolver::new(
            Arc::new(MemoryPriceCache::new()),
            api.clone(),
            PriceSettings::default(),
        ));
        let settings = WorkerSettings {
            concurrency: 2,
            idle_poll: Duration::from_millis(10),
            ..Default::default()
        };
        let worker = Arc::new(TransactionWorker::new(queue.clone(), resolver, store.clone(), settings));

        Harness { queue, store, api, worker }
    }

    #[tokio::test]
    async fn test_process_is_idempotent() {
        let h = harness(vec![kline_response("1800.123456")]);
        let payload = JobPayload::RecordTransaction(descriptor("0xabc", 1));

        assert_eq!(h.worker.process(&payload).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(h.worker.process(&payload).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(h.store.count_hash("0xabc"), 1);
        // Second run hit the price cache
        assert_eq!(h.api.calls(), 1);
    }

    #[tokio::test]
    async fn test_same_hash_from_both_sources_is_stored_once() {
        const HASH: B256 = b256!("0000000000000000000000000000000000000000000000000000000000000abc");
        let hash = format!("{:?}", HASH);
        let h = harness(vec![kline_response("1800.123456")]);

        let chain = Arc::new(MockChainSource::default().with_receipt(HASH, 7, 21_000, 20_000_000_000));
        chain.set_block_timestamp(7, 1_700_000_000);
        let listener = SwapListener::new(&test_config(), chain, h.queue.clone()).unwrap();
        listener
            .handle_event(SwapEvent { tx_hash: Some(HASH), block_number: Some(7) })
            .await;

        let history = Arc::new(MockHistorySource::with(vec![Ok(vec![token_tx(&hash, 7)])]));
        HistoricalSync::new(history, h.queue.clone(), RetryPolicy::default())
            .sync("0xpool", 0, 10)
            .await;

        assert_eq!(h.queue.counts().await.unwrap().waiting, 2);
        while assert_ok!(h.worker.run_once().await) {}

        assert_eq!(h.store.count_hash(&hash), 1);
        assert_eq!(h.queue.counts().await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_price_failure_is_retried_by_queue() {
        let h = harness(vec![KlineResponse { status: 500, ..Default::default() }]);
        let mut events = h.worker.subscribe();
        h.queue
            .enqueue_transaction(descriptor("0xabc", 1), RetryPolicy::default())
            .await
            .unwrap();

        assert!(h.worker.run_once().await.unwrap());

        assert_eq!(h.store.len(), 0);
        assert_eq!(h.queue.counts().await.unwrap().delayed, 1);
        match events.recv().await.unwrap() {
            WorkerEvent::Failed { disposition, reason, .. } => {
                assert_eq!(
                    disposition,
                    FailureDisposition::Retrying { attempt: 1, delay: Duration::from_secs(5) }
                );
                assert!(reason.contains("500"));
            }
            other => panic!("expected failure event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_price_fails_without_retry() {
        let h = harness(vec![kline_response("-1")]);
        let mut events = h.worker.subscribe();
        h.queue
            .enqueue_transaction(descriptor("0xabc", 1), RetryPolicy::default())
            .await
            .unwrap();

        assert!(h.worker.run_once().await.unwrap());

        let counts = h.queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.delayed + counts.waiting, 0);
        match events.recv().await.unwrap() {
            WorkerEvent::Failed { disposition, .. } => {
                assert_eq!(disposition, FailureDisposition::Exhausted { attempts: 1 });
            }
            other => panic!("expected failure event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue() {
        let h = harness(Vec::new());
        assert!(!h.worker.run_once().await.unwrap());
        assert!(h.queue.claim(LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_started_worker_drains_duplicates() {
        let h = harness(vec![kline_response("1800")]);
        for _ in 0..2 {
            h.queue
                .enqueue_transaction(descriptor("0xabc", 1), RetryPolicy::default())
                .await
                .unwrap();
        }
        h.queue
            .enqueue_transaction(descriptor("0xdef", 2), RetryPolicy::default())
            .await
            .unwrap();

        let handle = h.worker.clone().start();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.counts().await.unwrap().completed < 3 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        handle.shutdown().await;

        assert!(drained.is_ok());
        assert_eq!(h.store.count_hash("0xabc"), 1);
        assert_eq!(h.store.len(), 2);
    }
}
