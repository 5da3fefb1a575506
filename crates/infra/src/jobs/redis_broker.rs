//! Redis-backed broker (durable, shared across processes).
//!
//! ## Layout (per queue, under `<prefix>:queue:<name>`)
//!
//! - `:jobs`      HASH   job id -> JSON job document
//! - `:waiting`   LIST   ids ready to claim (FIFO: RPUSH / LPOP)
//! - `:delayed`   ZSET   ids scored by ready time (epoch ms)
//! - `:active`    ZSET   ids claimed by a worker, scored by lease deadline (epoch ms)
//! - `:completed` LIST   newest first, bounded by `keep_completed`
//! - `:failed`    LIST   dead letters, newest first, bounded by `keep_failed`
//! - `:options`   STRING JSON queue options (first declaration wins)
//!
//! Promotion of due delayed jobs and the claim itself run in one Lua script, so
//! two workers can never claim the same id. Settling (complete, retry, dead
//! letter) is one script as well: it only applies while the job still holds the
//! lease it was loaded with, so a late worker cannot overwrite a recovered job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use modbridge_core::Clock;

use super::broker::{Broker, BrokerConnector, BrokerError, ReleasedJob};
use super::types::{
    DeadLetterEntry, FailureOutcome, Job, JobId, JobState, QueueMetricsSnapshot, QueueOptions,
    STALLED_ERROR, saturating_add,
};

/// KEYS: waiting, delayed, active, jobs. ARGV: now_ms, lease_until_ms.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('RPUSH', KEYS[1], id)
end
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local doc = redis.call('HGET', KEYS[4], id)
  if doc then
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    return {id, doc}
  end
end
"#;

/// KEYS: active, jobs, target. ARGV: id, doc, lease_ms, mode, n.
///
/// `mode` is `delay` (ZADD target with score n) or `archive` (LPUSH target, keep n).
/// Returns -1 without touching anything when the job no longer holds `lease_ms`,
/// otherwise the number of history entries evicted.
const SETTLE_SCRIPT: &str = r#"
local lease = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not lease or tonumber(lease) ~= tonumber(ARGV[3]) then
  return -1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
if ARGV[4] == 'delay' then
  redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
  return 0
end
redis.call('LPUSH', KEYS[3], ARGV[1])
local keep = tonumber(ARGV[5])
local evicted = redis.call('LRANGE', KEYS[3], keep, -1)
for _, id in ipairs(evicted) do
  redis.call('HDEL', KEYS[2], id)
end
if keep == 0 then
  redis.call('DEL', KEYS[3])
else
  redis.call('LTRIM', KEYS[3], 0, keep - 1)
end
return #evicted
"#;

/// KEYS: failed, jobs.
const PURGE_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  redis.call('HDEL', KEYS[2], id)
end
redis.call('DEL', KEYS[1])
return #ids
"#;

struct Keys {
    jobs: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    options: String,
}

/// Where a settled job goes.
enum Destination<'a> {
    /// Sorted set scored by retry time (epoch ms).
    Delayed(&'a str, i64),
    /// Bounded history list.
    History(&'a str, usize),
}

fn not_active(id: JobId) -> BrokerError {
    BrokerError::Command(format!("job {id} is not active"))
}

/// Lease the job was claimed under, as stored in the active set.
fn held_lease(job: &Job) -> Result<i64, BrokerError> {
    match (job.state, job.lease_until) {
        (JobState::Active, Some(until)) => Ok(until.timestamp_millis()),
        _ => Err(not_active(job.id)),
    }
}

fn map_redis(err: RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        BrokerError::Connection(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}

/// Redis broker over a multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    prefix: String,
    clock: Arc<dyn Clock>,
    options: Arc<Mutex<HashMap<String, QueueOptions>>>,
    claim: Arc<Script>,
    settle: Arc<Script>,
    purge: Arc<Script>,
}

impl core::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect to Redis.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - key namespace (e.g., "modbridge")
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis)?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "redis broker connected");

        Ok(Self {
            conn,
            prefix,
            clock,
            options: Arc::new(Mutex::new(HashMap::new())),
            claim: Arc::new(Script::new(CLAIM_SCRIPT)),
            settle: Arc::new(Script::new(SETTLE_SCRIPT)),
            purge: Arc::new(Script::new(PURGE_SCRIPT)),
        })
    }

    fn keys(&self, queue: &str) -> Keys {
        let base = format!("{}:queue:{}", self.prefix, queue);
        Keys {
            jobs: format!("{base}:jobs"),
            waiting: format!("{base}:waiting"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            options: format!("{base}:options"),
        }
    }

    fn options_for(&self, queue: &str) -> QueueOptions {
        let options = self.options.lock().unwrap_or_else(|p| p.into_inner());
        options.get(queue).copied().unwrap_or_default()
    }

    async fn load(&self, keys: &Keys, id: JobId) -> Result<Job, BrokerError> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = redis::cmd("HGET")
            .arg(&keys.jobs)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        let doc = doc.ok_or(BrokerError::NotFound(id))?;
        Ok(serde_json::from_str(&doc)?)
    }

    async fn store(&self, keys: &Keys, job: &Job) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let doc = serde_json::to_string(job)?;
        let _: i64 = redis::cmd("HSET")
            .arg(&keys.jobs)
            .arg(job.id.to_string())
            .arg(doc)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(())
    }

    /// Store `job` and move it out of the active set in one step.
    ///
    /// Returns `false` when the job no longer holds `lease_ms` (another worker
    /// or a stall recovery settled it first); nothing is written then.
    async fn settle(
        &self,
        keys: &Keys,
        job: &Job,
        lease_ms: i64,
        destination: Destination<'_>,
    ) -> Result<bool, BrokerError> {
        let doc = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.settle.prepare_invoke();
        invocation
            .key(&keys.active)
            .key(&keys.jobs)
            .arg(job.id.to_string())
            .arg(doc)
            .arg(lease_ms);
        match destination {
            Destination::Delayed(target, score) => {
                invocation.key(target).arg("delay").arg(score);
            }
            Destination::History(target, keep) => {
                invocation.key(target).arg("archive").arg(keep);
            }
        }

        let evicted: i64 = invocation.invoke_async(&mut conn).await.map_err(map_redis)?;
        if evicted > 0 {
            debug!(queue = %job.queue_name, evicted, "evicted old jobs from history");
        }
        Ok(evicted >= 0)
    }

    async fn settle_failure(
        &self,
        keys: &Keys,
        job: &Job,
        lease_ms: i64,
        outcome: FailureOutcome,
    ) -> Result<bool, BrokerError> {
        let destination = match outcome {
            FailureOutcome::Retrying { retry_at, .. } => {
                Destination::Delayed(&keys.delayed, retry_at.timestamp_millis())
            }
            FailureOutcome::DeadLettered { .. } => {
                Destination::History(&keys.failed, self.options_for(&job.queue_name).keep_failed)
            }
        };
        self.settle(keys, job, lease_ms, destination).await
    }

    async fn fetch(&self, keys: &Keys, ids: &[String]) -> Result<Vec<Job>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let docs: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&keys.jobs)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;

        docs.into_iter()
            .flatten()
            .map(|doc| serde_json::from_str(&doc).map_err(BrokerError::from))
            .collect()
    }
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(())
    }

    async fn ensure_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let doc = serde_json::to_string(options)?;

        let _: Option<String> = redis::cmd("SET")
            .arg(&keys.options)
            .arg(doc)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        let stored: Option<String> = redis::cmd("GET")
            .arg(&keys.options)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;

        let effective = match stored {
            Some(doc) => serde_json::from_str(&doc)?,
            None => *options,
        };
        self.options
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(queue.to_string(), effective);
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError> {
        let keys = self.keys(&job.queue_name);
        let mut conn = self.conn.clone();
        let id = job.id.to_string();
        let doc = serde_json::to_string(&job)?;

        let created: i64 = redis::cmd("HSETNX")
            .arg(&keys.jobs)
            .arg(&id)
            .arg(doc)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        if created == 0 {
            return Err(BrokerError::Command(format!("job already exists: {id}")));
        }

        if job.state == JobState::Delayed {
            let _: i64 = redis::cmd("ZADD")
                .arg(&keys.delayed)
                .arg(job.ready_at.timestamp_millis())
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(map_redis)?;
        } else {
            let _: i64 = redis::cmd("RPUSH")
                .arg(&keys.waiting)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(map_redis)?;
        }
        Ok(job.id)
    }

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, BrokerError> {
        match self.load(&self.keys(queue), id).await {
            Ok(job) => Ok(Some(job)),
            Err(BrokerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, BrokerError> {
        let keys = self.keys(queue);
        let now = self.clock.now();
        let lease = self.options_for(queue).stall_timeout;
        let mut conn = self.conn.clone();

        let mut invocation = self.claim.prepare_invoke();
        invocation
            .key(&keys.waiting)
            .key(&keys.delayed)
            .key(&keys.active)
            .key(&keys.jobs)
            .arg(now.timestamp_millis())
            .arg(saturating_add(now, lease).timestamp_millis());
        let claimed: Option<(String, String)> =
            invocation.invoke_async(&mut conn).await.map_err(map_redis)?;

        let Some((_, doc)) = claimed else {
            return Ok(None);
        };
        let mut job: Job = serde_json::from_str(&doc)?;
        job.mark_active(now, lease);
        // If this write is lost the lease still lapses and recovery settles the job.
        self.store(&keys, &job).await?;
        Ok(Some(job))
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        return_value: Option<JsonValue>,
    ) -> Result<Job, BrokerError> {
        let keys = self.keys(queue);
        let mut job = self.load(&keys, id).await?;
        let lease_ms = held_lease(&job)?;

        job.mark_completed(self.clock.now(), return_value);
        let keep = self.options_for(queue).keep_completed;
        if !self
            .settle(&keys, &job, lease_ms, Destination::History(&keys.completed, keep))
            .await?
        {
            return Err(not_active(id));
        }
        Ok(job)
    }

    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
    ) -> Result<(Job, FailureOutcome), BrokerError> {
        let keys = self.keys(queue);
        let mut job = self.load(&keys, id).await?;
        let lease_ms = held_lease(&job)?;

        let outcome = job.mark_failed(self.clock.now(), error);
        if !self.settle_failure(&keys, &job, lease_ms, outcome).await? {
            return Err(not_active(id));
        }
        Ok((job, outcome))
    }

    async fn recover_stalled(&self, queue: &str) -> Result<Vec<(Job, FailureOutcome)>, BrokerError> {
        let keys = self.keys(queue);
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let lapsed: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(&keys.active)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;

        let mut recovered = Vec::with_capacity(lapsed.len());
        for (id, lease) in lapsed {
            let id: JobId = id
                .parse()
                .map_err(|e| BrokerError::Serialization(format!("bad job id in active set: {e}")))?;
            let mut job = match self.load(&keys, id).await {
                Ok(job) => job,
                Err(BrokerError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if job.state != JobState::Active {
                // The claim's own write never landed; the attempt still counts.
                job.mark_active(now, Duration::ZERO);
            }

            let outcome = job.mark_failed(now, STALLED_ERROR);
            if self.settle_failure(&keys, &job, lease as i64, outcome).await? {
                warn!(queue = %queue, job_id = %id, "recovered job with a lapsed lease");
                recovered.push((job, outcome));
            }
        }
        Ok(recovered)
    }

    async fn counts(&self, queue: &str) -> Result<QueueMetricsSnapshot, BrokerError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let (waiting, active, completed, failed, delayed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .cmd("LLEN")
                .arg(&keys.waiting)
                .cmd("ZCARD")
                .arg(&keys.active)
                .cmd("LLEN")
                .arg(&keys.completed)
                .cmd("LLEN")
                .arg(&keys.failed)
                .cmd("ZCARD")
                .arg(&keys.delayed)
                .query_async(&mut conn)
                .await
                .map_err(map_redis)?;

        Ok(QueueMetricsSnapshot {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn list_by_state(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let stop = limit as i64 - 1;

        let ids: Vec<String> = match state {
            JobState::Waiting => redis::cmd("LRANGE").arg(&keys.waiting).arg(0).arg(stop),
            JobState::Delayed => redis::cmd("ZRANGE").arg(&keys.delayed).arg(0).arg(stop),
            JobState::Active => redis::cmd("ZRANGE").arg(&keys.active).arg(0).arg(-1),
            JobState::Completed => redis::cmd("LRANGE").arg(&keys.completed).arg(0).arg(stop),
            JobState::Failed => redis::cmd("LRANGE").arg(&keys.failed).arg(0).arg(stop),
        }
        .query_async(&mut conn)
        .await
        .map_err(map_redis)?;

        let mut jobs = self.fetch(&keys, &ids).await?;
        if state == JobState::Active {
            jobs.sort_by_key(|j| (j.processed_at, j.id));
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        let jobs = self.list_by_state(queue, JobState::Failed, limit).await?;
        Ok(jobs.into_iter().map(DeadLetterEntry::from_job).collect())
    }

    async fn release_dead_letter(&self, queue: &str, id: JobId) -> Result<ReleasedJob, BrokerError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let removed: i64 = redis::cmd("LREM")
            .arg(&keys.failed)
            .arg(1)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        if removed == 0 {
            return Err(BrokerError::NotFound(id));
        }

        let previous = self.load(&keys, id).await?;
        let job = previous.released(self.clock.now());
        let doc = serde_json::to_string(&job)?;

        let _: () = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(&keys.jobs)
            .arg(id.to_string())
            .ignore()
            .cmd("HSET")
            .arg(&keys.jobs)
            .arg(job.id.to_string())
            .arg(doc)
            .ignore()
            .cmd("RPUSH")
            .arg(&keys.waiting)
            .arg(job.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;

        Ok(ReleasedJob { previous, job })
    }

    async fn clear_dead_letters(&self, queue: &str) -> Result<u64, BrokerError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let mut invocation = self.purge.prepare_invoke();
        invocation.key(&keys.failed).key(&keys.jobs);
        let purged: u64 = invocation.invoke_async(&mut conn).await.map_err(map_redis)?;
        Ok(purged)
    }
}

/// Connector creating one [`RedisBroker`] per (re)connect.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: String,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl RedisConnector {
    pub fn new(url: impl Into<String>, prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            url: url.into(),
            prefix: prefix.into(),
            clock,
        }
    }
}

#[async_trait::async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let broker = RedisBroker::connect(&self.url, self.prefix.clone(), self.clock.clone()).await?;
        Ok(Arc::new(broker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::jobs::types::{JobOptions, RetryPolicy};
    use modbridge_core::ManualClock;

    async fn broker(clock: &ManualClock) -> RedisBroker {
        let prefix = format!("modbridge-test-{}", uuid::Uuid::now_v7());
        RedisBroker::connect("redis://127.0.0.1/", prefix, Arc::new(clock.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at redis://127.0.0.1/"]
    async fn redis_retry_then_dead_letter_then_release() {
        let clock = ManualClock::starting_now();
        let broker = broker(&clock).await;
        broker.ensure_queue("moderation", &QueueOptions::default()).await.unwrap();

        let job = Job::new(
            "moderation",
            "BAN_USER",
            serde_json::json!({"targetUserId": "123"}),
            &RetryPolicy::fixed(2, Duration::from_secs(1)),
            &JobOptions::default(),
            clock.now(),
        );
        let id = broker.enqueue(job).await.unwrap();

        broker.claim_next("moderation").await.unwrap().unwrap();
        let (_, outcome) = broker.fail("moderation", id, "boom").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { .. }));
        assert!(broker.claim_next("moderation").await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let claimed = broker.claim_next("moderation").await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
        let (_, outcome) = broker.fail("moderation", id, "boom").await.unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { attempts: 2 });

        let dead = broker.list_dead_letters("moderation", 10).await.unwrap();
        assert_eq!(dead.len(), 1);

        let released = broker.release_dead_letter("moderation", id).await.unwrap();
        assert_eq!(released.job.attempts, 0);
        assert_eq!(broker.counts("moderation").await.unwrap().waiting, 1);
        assert_eq!(broker.clear_dead_letters("moderation").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at redis://127.0.0.1/"]
    async fn redis_lapsed_lease_is_recovered_once_and_late_settle_is_refused() {
        let clock = ManualClock::starting_now();
        let broker = broker(&clock).await;
        broker.ensure_queue("moderation", &QueueOptions::default()).await.unwrap();

        let job = Job::new(
            "moderation",
            "BAN_USER",
            serde_json::json!({}),
            &RetryPolicy::fixed(3, Duration::from_secs(1)),
            &JobOptions::default(),
            clock.now(),
        );
        let id = broker.enqueue(job).await.unwrap();
        broker.claim_next("moderation").await.unwrap().unwrap();

        assert!(broker.recover_stalled("moderation").await.unwrap().is_empty());
        clock.advance(Duration::from_secs(30));

        let recovered = broker.recover_stalled("moderation").await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(matches!(recovered[0].1, FailureOutcome::Retrying { attempts: 1, .. }));
        assert!(broker.recover_stalled("moderation").await.unwrap().is_empty());

        let err = broker.complete("moderation", id, None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Command(_)));
        let stored = broker.get_job("moderation", id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert_eq!(stored.last_error.as_deref(), Some(STALLED_ERROR));
        assert_eq!(broker.counts("moderation").await.unwrap().active, 0);
    }
}
