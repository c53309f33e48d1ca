//! Redis queue backend
//!
//! Layout under `{prefix}:{queue}`:
//! - `:id`        INCR counter for job ids
//! - `:jobs`      hash id → job JSON
//! - `:wait`      zset id → ready-at (unix ms)
//! - `:active`    zset id → lock deadline (unix ms)
//! - `:failed`    zset id → failed-at (unix ms)
//! - `:completed` counter
//!
//! Every transition is a Lua script so a job is never in two sets at once.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::{debug, error};

use super::{Job, JobCounts, JobId, JobPayload, QueueBackend, QueueError, RetryPolicy};

const KEY_PREFIX: &str = "pfi";

// KEYS: wait, active, jobs, failed | ARGV: now, lock_ms
const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then return false end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
local body = redis.call('HGET', KEYS[3], id)
if not body then return false end
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
return {id, body}
"#;

// KEYS: active | ARGV: id, deadline
const EXTEND_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

// KEYS: active, jobs, completed | ARGV: id
const COMPLETE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('INCR', KEYS[3])
return 1
"#;

// KEYS: active, jobs, target zset | ARGV: id, body, score
const MOVE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

// KEYS: active, jobs, target zset | ARGV: id, body, score, now
const STALLED_SCRIPT: &str = r#"
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not deadline or tonumber(deadline) > tonumber(ARGV[4]) then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Keys {
    id: String,
    jobs: String,
    wait: String,
    active: String,
    failed: String,
    completed: String,
}

impl Keys {
    fn new(queue: &str) -> Self {
        let base = format!("{}:{}", KEY_PREFIX, queue);
        Self {
            id: format!("{}:id", base),
            jobs: format!("{}:jobs", base),
            wait: format!("{}:wait", base),
            active: format!("{}:active", base),
            failed: format!("{}:failed", base),
            completed: format!("{}:completed", base),
        }
    }
}

pub struct RedisQueueBackend {
    manager: ConnectionManager,
    keys: Keys,
    claim: Script,
    extend: Script,
    complete: Script,
    move_job: Script,
    stalled: Script,
}

impl RedisQueueBackend {
    pub async fn connect(url: &str, queue: &str) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        debug!("Redis queue backend connected ({})", queue);

        Ok(Self {
            manager,
            keys: Keys::new(queue),
            claim: Script::new(CLAIM_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            move_job: Script::new(MOVE_SCRIPT),
            stalled: Script::new(STALLED_SCRIPT),
        })
    }

    fn decode(id: &str, body: &str) -> Result<Job, QueueError> {
        let id = id
            .parse::<u64>()
            .map(JobId)
            .map_err(|e| QueueError::Backend(format!("bad job id {:?}: {}", id, e)))?;
        serde_json::from_str(body).map_err(|e| QueueError::Corrupt {
            id,
            reason: e.to_string(),
        })
    }

    fn encode(job: &Job) -> Result<String, QueueError> {
        serde_json::to_string(job).map_err(|e| QueueError::Backend(e.to_string()))
    }

    async fn move_active(&self, job: &Job, target: &str, score: i64) -> Result<bool, QueueError> {
        let mut conn = self.manager.clone();
        let moved: i32 = self
            .move_job
            .key(&self.keys.active)
            .key(&self.keys.jobs)
            .key(target)
            .arg(job.id.0)
            .arg(Self::encode(job)?)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn move_stalled(&self, job: &Job, target: &str) -> Result<bool, QueueError> {
        let mut conn = self.manager.clone();
        let now = now_ms();
        let moved: i32 = self
            .stalled
            .key(&self.keys.active)
            .key(&self.keys.jobs)
            .key(target)
            .arg(job.id.0)
            .arg(Self::encode(job)?)
            .arg(now)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    /// Park an undecodable job in the failed set so it is never redelivered.
    async fn bury_corrupt(&self, id: &str, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(&self.keys.active, id)
            .ignore()
            .zadd(&self.keys.failed, id, now_ms())
            .ignore()
            .query_async(&mut conn)
            .await?;
        error!("💀 job {} buried: {}", id, reason);
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push(&self, payload: JobPayload, policy: RetryPolicy) -> Result<JobId, QueueError> {
        let mut conn = self.manager.clone();
        let id: u64 = conn.incr(&self.keys.id, 1).await?;
        let job = Job::new(JobId(id), payload, policy);

        let _: () = redis::pipe()
            .atomic()
            .hset(&self.keys.jobs, id, Self::encode(&job)?)
            .ignore()
            .zadd(&self.keys.wait, id, now_ms())
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(job.id)
    }

    async fn claim(&self, lock: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.manager.clone();
        let claimed: Option<(String, String)> = self
            .claim
            .key(&self.keys.wait)
            .key(&self.keys.active)
            .key(&self.keys.jobs)
            .arg(now_ms())
            .arg(lock.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        let Some((id, body)) = claimed else {
            return Ok(None);
        };

        match Self::decode(&id, &body) {
            Ok(job) => Ok(Some(job)),
            Err(e @ QueueError::Corrupt { .. }) => {
                self.bury_corrupt(&id, &e.to_string()).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn extend_lock(&self, id: JobId, lock: Duration) -> Result<bool, QueueError> {
        let mut conn = self.manager.clone();
        let extended: i32 = self
            .extend
            .key(&self.keys.active)
            .arg(id.0)
            .arg(now_ms() + lock.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn complete(&self, id: JobId) -> Result<bool, QueueError> {
        let mut conn = self.manager.clone();
        let done: i32 = self
            .complete
            .key(&self.keys.active)
            .key(&self.keys.jobs)
            .key(&self.keys.completed)
            .arg(id.0)
            .invoke_async(&mut conn)
            .await?;
        Ok(done == 1)
    }

    async fn retry(&self, job: &Job, delay: Duration) -> Result<bool, QueueError> {
        let ready_at = now_ms() + delay.as_millis() as i64;
        self.move_active(job, &self.keys.wait, ready_at).await
    }

    async fn fail(&self, job: &Job) -> Result<bool, QueueError> {
        self.move_active(job, &self.keys.failed, now_ms()).await
    }

    async fn expired(&self) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.manager.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(&self.keys.active, "-inf", now_ms())
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let bodies: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.keys.jobs)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for (id, body) in ids.iter().zip(bodies) {
            match body.as_deref().map(|b| Self::decode(id, b)) {
                Some(Ok(job)) => jobs.push(job),
                Some(Err(e)) => self.bury_corrupt(id, &e.to_string()).await?,
                None => self.bury_corrupt(id, "job body missing").await?,
            }
        }
        Ok(jobs)
    }

    async fn requeue_stalled(&self, job: &Job) -> Result<bool, QueueError> {
        self.move_stalled(job, &self.keys.wait).await
    }

    async fn fail_stalled(&self, job: &Job) -> Result<bool, QueueError> {
        self.move_stalled(job, &self.keys.failed).await
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.manager.clone();
        let now = now_ms();
        let (waiting, delayed, active, failed, completed): (u64, u64, u64, u64, Option<u64>) =
            redis::pipe()
                .zcount(&self.keys.wait, "-inf", now)
                .zcount(&self.keys.wait, format!("({}", now), "+inf")
                .zcard(&self.keys.active)
                .zcard(&self.keys.failed)
                .get(&self.keys.completed)
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed: completed.unwrap_or(0),
            failed,
        })
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let ids: Vec<String> = conn
            .zrevrange(&self.keys.failed, 0, limit as isize - 1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let bodies: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.keys.jobs)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        Ok(ids
            .iter()
            .zip(bodies)
            .filter_map(|(id, body)| body.and_then(|b| Self::decode(id, &b).ok()))
            .collect())
    }
}
