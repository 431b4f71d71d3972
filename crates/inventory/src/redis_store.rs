//! Redis counter tier. Reservation scripts run server-side in Lua so each
//! check-and-decrement is a single atomic step.

use async_trait::async_trait;
use common::ProductId;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use tracing::info;

use crate::{CounterError, CounterStore, RateLimitConfig, ScriptOutcome};

const RESERVE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -2
end
current = tonumber(current)
local quantity = tonumber(ARGV[1])
if current < quantity then
    return -1
end
return redis.call('DECRBY', KEYS[1], quantity)
"#;

const RATE_LIMITED_RESERVE_SCRIPT: &str = r#"
local calls = redis.call('INCR', KEYS[2])
if calls == 1 then
    redis.call('EXPIRE', KEYS[2], tonumber(ARGV[3]))
end
if calls > tonumber(ARGV[2]) then
    return -3
end
local current = redis.call('GET', KEYS[1])
if not current then
    return -2
end
current = tonumber(current)
local quantity = tonumber(ARGV[1])
if current < quantity then
    return -1
end
return redis.call('DECRBY', KEYS[1], quantity)
"#;

const RESTORE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -2
end
return redis.call('INCRBY', KEYS[1], tonumber(ARGV[1]))
"#;

/// Redis implementation of [`CounterStore`].
///
/// Key format: `{prefix}:stock:{product_id}` and
/// `{prefix}:ratelimit:{caller_id}:{product_id}`.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    key_prefix: String,
    reserve: Script,
    rate_limited_reserve: Script,
    restore: Script,
}

impl RedisCounterStore {
    /// Connects to `url` (e.g. `redis://localhost:6379`).
    pub async fn new(url: &str, key_prefix: Option<&str>) -> Result<Self, CounterError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis for stock counters");

        Ok(Self {
            conn,
            key_prefix: key_prefix.unwrap_or("fulfillment").to_string(),
            reserve: Script::new(RESERVE_SCRIPT),
            rate_limited_reserve: Script::new(RATE_LIMITED_RESERVE_SCRIPT),
            restore: Script::new(RESTORE_SCRIPT),
        })
    }

    fn stock_key(&self, product_id: &ProductId) -> String {
        format!("{}:stock:{}", self.key_prefix, product_id)
    }

    fn rate_key(&self, caller_id: &str, product_id: &ProductId) -> String {
        format!("{}:ratelimit:{}:{}", self.key_prefix, caller_id, product_id)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, product_id: &ProductId) -> Result<Option<i64>, CounterError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.stock_key(product_id)).await?)
    }

    async fn set(&self, product_id: &ProductId, quantity: i64) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.stock_key(product_id), quantity).await?;
        Ok(())
    }

    async fn init_if_absent(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<bool, CounterError> {
        let mut conn = self.conn.clone();
        Ok(conn.set_nx(self.stock_key(product_id), quantity).await?)
    }

    async fn decrement(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<ScriptOutcome, CounterError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .reserve
            .key(self.stock_key(product_id))
            .arg(quantity)
            .invoke_async(&mut conn)
            .await?;
        ScriptOutcome::from_code(code)
    }

    async fn decrement_rate_limited(
        &self,
        product_id: &ProductId,
        caller_id: &str,
        quantity: i64,
        limit: &RateLimitConfig,
    ) -> Result<ScriptOutcome, CounterError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .rate_limited_reserve
            .key(self.stock_key(product_id))
            .key(self.rate_key(caller_id, product_id))
            .arg(quantity)
            .arg(limit.max_calls)
            .arg(limit.window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        ScriptOutcome::from_code(code)
    }

    async fn increment(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<Option<i64>, CounterError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .restore
            .key(self.stock_key(product_id))
            .arg(quantity)
            .invoke_async(&mut conn)
            .await?;
        Ok((code != ScriptOutcome::NOT_FOUND).then_some(code))
    }

    async fn invalidate(&self, product_id: &ProductId) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.stock_key(product_id)).await?;
        Ok(())
    }
}
