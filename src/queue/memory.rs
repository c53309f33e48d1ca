//! In-process queue backend
//!
//! Same state machine as the Redis backend, held behind a mutex. Uses
//! `tokio::time::Instant` so paused-clock tests drive backoff and locks.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Job, JobCounts, JobId, JobPayload, QueueBackend, QueueError, RetryPolicy};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Waiting { ready_at: Instant },
    Active { lock_until: Instant },
    Failed { seq: u64 },
}

#[derive(Default)]
struct State {
    next_id: u64,
    failed_seq: u64,
    completed: u64,
    jobs: HashMap<JobId, (Job, Slot)>,
}

impl State {
    fn take_active(&mut self, id: JobId) -> Option<Job> {
        match self.jobs.get(&id) {
            Some((_, Slot::Active { .. })) => self.jobs.remove(&id).map(|(job, _)| job),
            _ => None,
        }
    }

    fn take_expired(&mut self, id: JobId) -> Option<Job> {
        let now = Instant::now();
        match self.jobs.get(&id) {
            Some((_, Slot::Active { lock_until })) if *lock_until <= now => {
                self.jobs.remove(&id).map(|(job, _)| job)
            }
            _ => None,
        }
    }

    fn park_failed(&mut self, job: &Job) {
        self.failed_seq += 1;
        let slot = Slot::Failed { seq: self.failed_seq };
        self.jobs.insert(job.id, (job.clone(), slot));
    }
}

#[derive(Default)]
pub struct MemoryQueueBackend {
    state: Mutex<State>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push(&self, payload: JobPayload, policy: RetryPolicy) -> Result<JobId, QueueError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = JobId(state.next_id);
        let slot = Slot::Waiting { ready_at: Instant::now() };
        state.jobs.insert(id, (Job::new(id, payload, policy), slot));
        Ok(id)
    }

    async fn claim(&self, lock: Duration) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let next = state
            .jobs
            .iter()
            .filter_map(|(id, (_, slot))| match slot {
                Slot::Waiting { ready_at } if *ready_at <= now => Some((*ready_at, *id)),
                _ => None,
            })
            .min()
            .map(|(_, id)| id);

        Ok(next.and_then(|id| {
            state.jobs.get_mut(&id).map(|(job, slot)| {
                *slot = Slot::Active { lock_until: now + lock };
                job.clone()
            })
        }))
    }

    async fn extend_lock(&self, id: JobId, lock: Duration) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some((_, slot @ Slot::Active { .. })) => {
                *slot = Slot::Active { lock_until: Instant::now() + lock };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: JobId) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.take_active(id).is_none() {
            return Ok(false);
        }
        state.completed += 1;
        Ok(true)
    }

    async fn retry(&self, job: &Job, delay: Duration) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.take_active(job.id).is_none() {
            return Ok(false);
        }
        let slot = Slot::Waiting { ready_at: Instant::now() + delay };
        state.jobs.insert(job.id, (job.clone(), slot));
        Ok(true)
    }

    async fn fail(&self, job: &Job) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.take_active(job.id).is_none() {
            return Ok(false);
        }
        state.park_failed(job);
        Ok(true)
    }

    async fn expired(&self) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|(_, slot)| matches!(slot, Slot::Active { lock_until } if *lock_until <= now))
            .map(|(job, _)| job.clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn requeue_stalled(&self, job: &Job) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.take_expired(job.id).is_none() {
            return Ok(false);
        }
        let slot = Slot::Waiting { ready_at: Instant::now() };
        state.jobs.insert(job.id, (job.clone(), slot));
        Ok(true)
    }

    async fn fail_stalled(&self, job: &Job) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.take_expired(job.id).is_none() {
            return Ok(false);
        }
        state.park_failed(job);
        Ok(true)
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut counts = JobCounts {
            completed: state.completed,
            ..JobCounts::default()
        };
        for (_, slot) in state.jobs.values() {
            match slot {
                Slot::Waiting { ready_at } if *ready_at <= now => counts.waiting += 1,
                Slot::Waiting { .. } => counts.delayed += 1,
                Slot::Active { .. } => counts.active += 1,
                Slot::Failed { .. } => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().await;
        let mut failed: Vec<(u64, Job)> = state
            .jobs
            .values()
            .filter_map(|(job, slot)| match slot {
                Slot::Failed { seq } => Some((*seq, job.clone())),
                _ => None,
            })
            .collect();
        failed.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(failed.into_iter().take(limit).map(|(_, job)| job).collect())
    }
}
