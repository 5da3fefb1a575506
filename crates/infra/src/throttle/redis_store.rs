//! Redis-backed counter store.
//!
//! Each key is a sorted set of `member -> score_ms`. The admit sequence runs as
//! one Lua script, so it is atomic across every process sharing the Redis.

use std::fmt;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script, Value};

use super::store::{CounterStore, CounterStoreError, WindowDecision, WindowSnapshot};

/// KEYS: window key. ARGV: now_ms, window_ms, max, member.
///
/// Returns `{admitted, count, oldest_ms}` with `oldest_ms = -1` when unknown.
const ADMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  local oldest_ms = -1
  if oldest[2] then
    oldest_ms = tonumber(oldest[2])
  end
  return {0, count, oldest_ms}
end
redis.call('ZADD', KEYS[1], now, ARGV[4])
redis.call('PEXPIRE', KEYS[1], window)
return {1, count + 1, -1}
"#;

fn map_redis(err: RedisError) -> CounterStoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        CounterStoreError::Connection(err.to_string())
    } else {
        CounterStoreError::Command(err.to_string())
    }
}

/// Decode the `{admitted, count, oldest_ms}` reply of the admit script.
fn decode_admit(reply: &Value) -> Result<WindowDecision, CounterStoreError> {
    let (admitted, count, oldest_ms): (i64, u64, i64) = redis::from_redis_value(reply)
        .map_err(|e| CounterStoreError::Command(format!("unexpected admit reply: {e}")))?;

    match admitted {
        1 => Ok(WindowDecision::Admitted { count }),
        0 => Ok(WindowDecision::Rejected {
            count,
            oldest_ms: (oldest_ms >= 0).then_some(oldest_ms),
        }),
        other => Err(CounterStoreError::Command(format!(
            "unexpected admit flag {other}"
        ))),
    }
}

/// Sliding-window counters shared through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    admit: Arc<Script>,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns `Connection` if the URL is invalid or Redis is unreachable.
    pub async fn connect(url: &str) -> Result<Self, CounterStoreError> {
        let client = Client::open(url).map_err(|e| CounterStoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis)?;
        Ok(Self {
            conn,
            admit: Arc::new(Script::new(ADMIT_SCRIPT)),
        })
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisCounterStore {
    async fn admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
        max: u32,
        member: &str,
    ) -> Result<WindowDecision, CounterStoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.admit.prepare_invoke();
        invocation.key(key).arg(now_ms).arg(window_ms).arg(max).arg(member);
        let reply: Value = invocation.invoke_async(&mut conn).await.map_err(map_redis)?;
        decode_admit(&reply)
    }

    async fn window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
    ) -> Result<WindowSnapshot, CounterStoreError> {
        let mut conn = self.conn.clone();
        let min = format!("({}", now_ms.saturating_sub(window_ms as i64));

        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .cmd("ZCOUNT")
            .arg(key)
            .arg(&min)
            .arg("+inf")
            .cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(&min)
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;

        Ok(WindowSnapshot {
            count,
            oldest_ms: oldest.first().map(|(_, score)| *score as i64),
        })
    }

    async fn remove(&self, key: &str) -> Result<bool, CounterStoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(removed > 0)
    }
}
