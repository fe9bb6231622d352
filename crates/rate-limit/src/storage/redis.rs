//! Redis bucket storage shared by every worker process.

use std::time::Duration;

use redis::{RedisError, Script, Value};

use super::{
    BucketStore, StorageError,
    redis_pool::{Pool, create_pool},
};
use crate::bucket::{BucketConfig, BucketState, TakeOutcome};
use config::RedisConfig;

/// Refill and consume in one atomic step. Floats are returned as strings,
/// because Redis truncates Lua numbers to integers in replies.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local tokens = capacity
local last_refill = now

local data = redis.call("HMGET", key, "tokens", "last_refill")
if data[1] then
  tokens = tonumber(data[1]) or capacity
end
if data[2] then
  last_refill = tonumber(data[2]) or now
end

local delta = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + delta * refill_rate)
last_refill = now

local allowed = 0
local retry_after = 0

if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
elseif refill_rate > 0 then
  retry_after = (cost - tokens) / refill_rate
end

redis.call("HSET", key, "tokens", tostring(tokens), "last_refill", tostring(last_refill))

return { allowed, tostring(tokens), tostring(last_refill), tostring(retry_after) }
"#;

/// Token buckets stored as Redis hashes with `tokens` and `last_refill` fields.
pub struct RedisBucketStore {
    pool: Pool,
    script: Script,
    key_prefix: String,
    response_timeout: Option<Duration>,
}

impl RedisBucketStore {
    /// Connects to Redis and verifies the connection with a `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = create_pool(config)
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

        log::debug!("Connected to Redis bucket store with key prefix '{}'", config.key_prefix);

        Ok(Self {
            pool,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            key_prefix: config.key_prefix.clone(),
            response_timeout: config.response_timeout,
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        let result = match self.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| StorageError::Connection(format!("Redis did not answer within {timeout:?}")))?,
            None => fut.await,
        };

        result.map_err(|e| StorageError::Query(e.to_string()))
    }
}

fn parse_float(raw: &str) -> Result<f64, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::UnexpectedReply(format!("not a number: {raw:?}")))
}

fn parse_reply(reply: &Value) -> Result<TakeOutcome, StorageError> {
    let (allowed, tokens, last_refill, retry_after): (i64, String, String, String) =
        redis::from_redis_value(reply).map_err(|e| StorageError::UnexpectedReply(e.to_string()))?;

    Ok(TakeOutcome {
        allowed: allowed == 1,
        state: BucketState {
            tokens: parse_float(&tokens)?,
            last_refill: parse_float(&last_refill)?,
        },
        retry_after_secs: parse_float(&retry_after)?,
    })
}

#[async_trait::async_trait]
impl BucketStore for RedisBucketStore {
    async fn take(&self, key: &str, config: BucketConfig, now: f64, cost: f64) -> Result<TakeOutcome, StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut invocation = self.script.key(self.redis_key(key));
        invocation
            .arg(config.capacity)
            .arg(config.refill_rate)
            .arg(now)
            .arg(cost);

        let reply: Value = self.with_timeout(invocation.invoke_async(&mut *conn)).await?;

        parse_reply(&reply)
    }

    async fn restore(&self, key: &str, state: BucketState) -> Result<(), StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let redis_key = self.redis_key(key);

        let mut cmd = redis::cmd("HSET");
        cmd.arg(&redis_key)
            .arg("tokens")
            .arg(state.tokens.to_string())
            .arg("last_refill")
            .arg(state.last_refill.to_string());

        self.with_timeout(cmd.query_async::<()>(&mut *conn)).await
    }
}
