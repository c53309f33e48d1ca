//! Durable work queue between discovery and processing
//!
//! Delivery is at-least-once: a job can reach a worker again after a crash,
//! a stall or a failed attempt, so every handler must be idempotent.
//!
//! Retry and stall policy lives in [`TransactionQueue`]; backends only
//! provide atomic state transitions:
//! - waiting (possibly delayed) → active, with a lock deadline
//! - active → completed | waiting (retry / stall) | failed

mod memory;
mod redis_backend;

pub use memory::MemoryQueueBackend;
pub use redis_backend::RedisQueueBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{DescriptorError, TransactionDescriptor};

// ============================================
// CONSTANTS
// ============================================

/// Queue carrying transactions to be recorded
pub const TX_QUEUE_NAME: &str = "transaction-queue";

/// Job name for recording a discovered transaction
pub const RECORD_TX_JOB_NAME: &str = "record-transaction";

// ============================================
// JOB TYPES
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed job payloads, one variant per job name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum JobPayload {
    #[serde(rename = "record-transaction")]
    RecordTransaction(TransactionDescriptor),
}

impl JobPayload {
    pub fn name(&self) -> &'static str {
        match self {
            JobPayload::RecordTransaction(_) => RECORD_TX_JOB_NAME,
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        match self {
            JobPayload::RecordTransaction(tx) => tx.validate(),
        }
    }

    /// Short identifier for log lines
    pub fn subject(&self) -> &str {
        match self {
            JobPayload::RecordTransaction(tx) => &tx.hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the next attempt, after `attempts_made` failures.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exp))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn exponential(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Exponential {
                delay_ms: base_delay.as_millis() as u64,
            },
        }
    }

    /// 5 attempts, exponential backoff starting at 5s
    pub fn record_transaction() -> Self {
        Self::exponential(5, Duration::from_secs(5))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::record_transaction()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub policy: RetryPolicy,
    pub attempts_made: u32,
    pub stalled_count: u32,
    /// Unix milliseconds
    pub created_at: i64,
    pub failed_reason: Option<String>,
}

impl Job {
    pub fn new(id: JobId, payload: JobPayload, policy: RetryPolicy) -> Self {
        Self {
            id,
            payload,
            policy,
            attempts_made: 0,
            stalled_count: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
            failed_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

// ============================================
// ERRORS
// ============================================

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("rejected {name} job: {source}")]
    InvalidPayload {
        name: &'static str,
        #[source]
        source: DescriptorError,
    },

    #[error("job {id} has an undecodable payload: {reason}")]
    Corrupt { id: JobId, reason: String },

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for QueueError {
    fn from(e: ::redis::RedisError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

// ============================================
// BACKEND
// ============================================

/// Storage for queue state. Every method is one atomic transition.
///
/// Transitions out of `active` report `false` when the job was no longer
/// active (its lock expired and the stall checker already moved it).
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a new waiting job and return its id.
    async fn push(&self, payload: JobPayload, policy: RetryPolicy) -> Result<JobId, QueueError>;

    /// Take the next ready job, marking it active until `lock` elapses.
    async fn claim(&self, lock: Duration) -> Result<Option<Job>, QueueError>;

    async fn extend_lock(&self, id: JobId, lock: Duration) -> Result<bool, QueueError>;

    async fn complete(&self, id: JobId) -> Result<bool, QueueError>;

    /// Store the updated job and make it ready again after `delay`.
    async fn retry(&self, job: &Job, delay: Duration) -> Result<bool, QueueError>;

    /// Move the job to the terminal failed set.
    async fn fail(&self, job: &Job) -> Result<bool, QueueError>;

    /// Active jobs whose lock has expired.
    async fn expired(&self) -> Result<Vec<Job>, QueueError>;

    /// Move a stalled job back to waiting, only if its lock is still
    /// expired. A lock renewed since `expired` was read wins.
    async fn requeue_stalled(&self, job: &Job) -> Result<bool, QueueError>;

    /// Like `requeue_stalled`, into the failed set.
    async fn fail_stalled(&self, job: &Job) -> Result<bool, QueueError>;

    async fn counts(&self) -> Result<JobCounts, QueueError>;

    /// Most recently failed jobs first.
    async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, QueueError>;
}

// ============================================
// QUEUE
// ============================================

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retrying { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    /// The job was no longer ours (stall recovery won the race)
    Lost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallReport {
    pub requeued: usize,
    pub failed: usize,
}

/// Named queue with retry and stall policy over a shared backend.
#[derive(Clone)]
pub struct TransactionQueue {
    name: String,
    backend: Arc<dyn QueueBackend>,
}

impl TransactionQueue {
    pub fn new(name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    /// In-process queue; nothing survives a restart
    pub fn in_memory() -> Self {
        Self::new(TX_QUEUE_NAME, Arc::new(MemoryQueueBackend::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate and persist a job. Returns once the backend accepted it.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        policy: RetryPolicy,
    ) -> Result<JobId, QueueError> {
        payload
            .validate()
            .map_err(|source| QueueError::InvalidPayload {
                name: payload.name(),
                source,
            })?;

        let subject = payload.subject().to_string();
        let id = self.backend.push(payload, policy).await?;
        debug!("📥 [{}] queued job {} ({})", self.name, id, subject);
        Ok(id)
    }

    pub async fn enqueue_transaction(
        &self,
        tx: TransactionDescriptor,
        policy: RetryPolicy,
    ) -> Result<JobId, QueueError> {
        self.enqueue(JobPayload::RecordTransaction(tx), policy).await
    }

    pub async fn claim(&self, lock: Duration) -> Result<Option<Job>, QueueError> {
        self.backend.claim(lock).await
    }

    pub async fn extend_lock(&self, id: JobId, lock: Duration) -> Result<bool, QueueError> {
        self.backend.extend_lock(id, lock).await
    }

    pub async fn complete(&self, job: &Job) -> Result<bool, QueueError> {
        self.backend.complete(job.id).await
    }

    /// Record a failed attempt: schedule a retry with backoff, or fail the
    /// job for good once its attempt budget is spent.
    pub async fn fail_attempt(
        &self,
        job: &Job,
        reason: &str,
    ) -> Result<FailureDisposition, QueueError> {
        self.record_failure(job, reason, true).await
    }

    /// Fail the job for good regardless of attempts left.
    pub async fn fail_permanently(
        &self,
        job: &Job,
        reason: &str,
    ) -> Result<FailureDisposition, QueueError> {
        self.record_failure(job, reason, false).await
    }

    async fn record_failure(
        &self,
        job: &Job,
        reason: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, QueueError> {
        let mut updated = job.clone();
        updated.attempts_made += 1;
        updated.failed_reason = Some(reason.to_string());

        if retryable && updated.attempts_made < updated.policy.attempts {
            let delay = updated.policy.backoff.delay_after(updated.attempts_made);
            if !self.backend.retry(&updated, delay).await? {
                return Ok(FailureDisposition::Lost);
            }
            Ok(FailureDisposition::Retrying {
                attempt: updated.attempts_made,
                delay,
            })
        } else {
            if !self.backend.fail(&updated).await? {
                return Ok(FailureDisposition::Lost);
            }
            Ok(FailureDisposition::Exhausted {
                attempts: updated.attempts_made,
            })
        }
    }

    /// Requeue jobs whose lock expired; fail those that stalled too often.
    pub async fn recover_stalled(&self, max_stalled_count: u32) -> Result<StallReport, QueueError> {
        let mut report = StallReport::default();

        for job in self.backend.expired().await? {
            let mut updated = job;
            updated.stalled_count += 1;

            if updated.stalled_count > max_stalled_count {
                updated.failed_reason = Some("job stalled more than allowable limit".to_string());
                if self.backend.fail_stalled(&updated).await? {
                    warn!(
                        "💀 [{}] job {} ({}) stalled {} times, failing permanently",
                        self.name,
                        updated.id,
                        updated.payload.subject(),
                        updated.stalled_count
                    );
                    report.failed += 1;
                }
            } else if self.backend.requeue_stalled(&updated).await? {
                warn!(
                    "⏳ [{}] job {} ({}) stalled, requeued ({}/{})",
                    self.name,
                    updated.id,
                    updated.payload.subject(),
                    updated.stalled_count,
                    max_stalled_count
                );
                report.requeued += 1;
            }
        }

        Ok(report)
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        self.backend.counts().await
    }

    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.backend.failed_jobs(limit).await
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::descriptor;
    use tokio::time::{advance, sleep};

    const LOCK: Duration = Duration::from_secs(30);

    #[test]
    fn test_exponential_backoff() {
        let backoff = RetryPolicy::record_transaction().backoff;
        assert_eq!(backoff.delay_after(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_after(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_after(4), Duration::from_secs(40));
    }

    #[test]
    fn test_payload_is_tagged_by_job_name() {
        let payload = JobPayload::RecordTransaction(descriptor("0xabc", 1));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["name"], "record-transaction");
        assert_eq!(json["data"]["hash"], "0xabc");

        let unknown = serde_json::json!({"name": "something-else", "data": {}});
        assert!(serde_json::from_value::<JobPayload>(unknown).is_err());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let queue = TransactionQueue::in_memory();
        let err = queue
            .enqueue_transaction(descriptor("", 1), RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload { .. }));
        assert_eq!(queue.counts().await.unwrap().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_back_off_then_exhaust() {
        let queue = TransactionQueue::in_memory();
        let policy = RetryPolicy::exponential(3, Duration::from_secs(5));
        queue.enqueue_transaction(descriptor("0xabc", 1), policy).await.unwrap();

        let job = queue.claim(LOCK).await.unwrap().unwrap();
        let disposition = queue.fail_attempt(&job, "boom").await.unwrap();
        assert_eq!(
            disposition,
            FailureDisposition::Retrying { attempt: 1, delay: Duration::from_secs(5) }
        );

        // Delayed: not claimable until the backoff elapses
        assert!(queue.claim(LOCK).await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().delayed, 1);
        advance(Duration::from_secs(5)).await;

        let job = queue.claim(LOCK).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        let disposition = queue.fail_attempt(&job, "boom").await.unwrap();
        assert_eq!(
            disposition,
            FailureDisposition::Retrying { attempt: 2, delay: Duration::from_secs(10) }
        );

        sleep(Duration::from_secs(10)).await;
        let job = queue.claim(LOCK).await.unwrap().unwrap();
        let disposition = queue.fail_attempt(&job, "still broken").await.unwrap();
        assert_eq!(disposition, FailureDisposition::Exhausted { attempts: 3 });

        // Terminal: never redelivered
        sleep(Duration::from_secs(3600)).await;
        assert!(queue.claim(LOCK).await.unwrap().is_none());

        let failed = queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_reason.as_deref(), Some("still broken"));
        assert_eq!(queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_job_is_requeued_then_failed() {
        let queue = TransactionQueue::in_memory();
        queue
            .enqueue_transaction(descriptor("0xabc", 1), RetryPolicy::default())
            .await
            .unwrap();

        for round in 1..=2 {
            let job = queue.claim(LOCK).await.unwrap().unwrap();
            assert_eq!(job.stalled_count, round - 1);

            // Lock still held: nothing to recover
            assert_eq!(queue.recover_stalled(1).await.unwrap(), StallReport::default());

            advance(LOCK + Duration::from_secs(1)).await;
            let report = queue.recover_stalled(1).await.unwrap();
            if round == 1 {
                assert_eq!(report, StallReport { requeued: 1, failed: 0 });
            } else {
                assert_eq!(report, StallReport { requeued: 0, failed: 1 });
            }
        }

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting + counts.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_after_stall_is_lost() {
        let queue = TransactionQueue::in_memory();
        queue
            .enqueue_transaction(descriptor("0xabc", 1), RetryPolicy::default())
            .await
            .unwrap();

        let job = queue.claim(LOCK).await.unwrap().unwrap();
        advance(LOCK * 2).await;
        queue.recover_stalled(3).await.unwrap();

        assert!(!queue.complete(&job).await.unwrap());
        assert_eq!(
            queue.fail_attempt(&job, "late").await.unwrap(),
            FailureDisposition::Lost
        );

        // The requeued copy is still deliverable
        let again = queue.claim(LOCK).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert!(queue.complete(&again).await.unwrap());
        assert_eq!(queue.counts().await.unwrap().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_skips_remaining_attempts() {
        let queue = TransactionQueue::in_memory();
        queue
            .enqueue_transaction(descriptor("0xabc", 1), RetryPolicy::default())
            .await
            .unwrap();

        let job = queue.claim(LOCK).await.unwrap().unwrap();
        assert_eq!(
            queue.fail_permanently(&job, "bad price").await.unwrap(),
            FailureDisposition::Exhausted { attempts: 1 }
        );

        sleep(Duration::from_secs(3600)).await;
        assert!(queue.claim(LOCK).await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_renewed_after_expiry_scan_is_not_requeued() {
        let backend = MemoryQueueBackend::new();
        backend
            .push(JobPayload::RecordTransaction(descriptor("0xabc", 1)), RetryPolicy::default())
            .await
            .unwrap();

        let job = backend.claim(LOCK).await.unwrap().unwrap();
        advance(LOCK + Duration::from_secs(1)).await;
        let expired = backend.expired().await.unwrap();
        assert_eq!(expired.len(), 1);

        // Heartbeat lands between the scan and the move
        assert!(backend.extend_lock(job.id, LOCK).await.unwrap());
        assert!(!backend.requeue_stalled(&expired[0]).await.unwrap());
        assert!(!backend.fail_stalled(&expired[0]).await.unwrap());

        let counts = backend.counts().await.unwrap();
        assert_eq!(counts.active, 1);
        assert!(backend.complete(job.id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_lock_prevents_stall() {
        let queue = TransactionQueue::in_memory();
        queue
            .enqueue_transaction(descriptor("0xabc", 1), RetryPolicy::default())
            .await
            .unwrap();

        let job = queue.claim(LOCK).await.unwrap().unwrap();
        advance(Duration::from_secs(20)).await;
        assert!(queue.extend_lock(job.id, LOCK).await.unwrap());
        advance(Duration::from_secs(20)).await;

        assert_eq!(queue.recover_stalled(3).await.unwrap(), StallReport::default());
        assert!(queue.complete(&job).await.unwrap());
    }
}
