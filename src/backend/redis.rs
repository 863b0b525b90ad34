use crate::backend::{Backend, Decision, WindowInput, WindowStatus};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

// KEYS[1] window hash {count, window}, ARGV[1] max requests, ARGV[2] window in milliseconds.
// Returns {allowed, count, ttl_millis, window}.
static REQUEST_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local max = tonumber(ARGV[1])
        local ttl = redis.call('PTTL', KEYS[1])
        if ttl < 0 then
            -- No live window, start a new one identified by the server time in microseconds
            local now = redis.call('TIME')
            local window = now[1] .. string.format('%06d', tonumber(now[2]))
            redis.call('DEL', KEYS[1])
            redis.call('HSET', KEYS[1], 'count', 0, 'window', window)
            redis.call('PEXPIRE', KEYS[1], ARGV[2])
            ttl = tonumber(ARGV[2])
        end
        local count = tonumber(redis.call('HGET', KEYS[1], 'count'))
        local window = redis.call('HGET', KEYS[1], 'window')
        if count >= max then
            return {0, count, ttl, window}
        end
        count = redis.call('HINCRBY', KEYS[1], 'count', 1)
        return {1, count, ttl, window}
        "#,
    )
});

// KEYS[1] window hash, ARGV[1] window. Saturating decrement of the live window only, leaves the
// expiry untouched.
static ROLLBACK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('HGET', KEYS[1], 'window') ~= ARGV[1] then
            return 0
        end
        local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
        if count > 0 then
            redis.call('HINCRBY', KEYS[1], 'count', -1)
        end
        return 1
        "#,
    )
});

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
}

/// A fixed window [Backend] that stores counters in Redis.
///
/// Every check is a single script invocation, so concurrent checks from separate processes
/// cannot both be admitted on the last free slot. Expiry is handled by the key TTL.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl RedisBackend {
    /// Create a RedisBackendBuilder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use action_rate_limit::backend::redis::RedisBackend;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let backend = RedisBackend::builder(manager).key_prefix(Some("rl:")).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
        }
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this backend.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisBackend {
        RedisBackend {
            connection: self.connection,
            key_prefix: self.key_prefix,
        }
    }
}

fn reset_after(ttl_millis: i64) -> Instant {
    Instant::now() + Duration::from_millis(ttl_millis.max(0) as u64)
}

impl Backend for RedisBackend {
    type Error = Error;

    async fn request(&self, input: WindowInput) -> Result<(Decision, WindowStatus), Self::Error> {
        let key = self.make_key(&input.key);
        let window_millis = input.interval.as_millis().clamp(1, i64::MAX as u128) as i64;

        let mut con = self.connection.clone();
        let (allowed, count, ttl, window): (i64, u64, i64, u64) = REQUEST_SCRIPT
            .key(key.as_ref())
            .arg(input.max_requests)
            .arg(window_millis)
            .invoke_async(&mut con)
            .await?;

        let status = WindowStatus {
            limit: input.max_requests,
            remaining: input.max_requests.saturating_sub(count),
            reset: reset_after(ttl),
            window,
        };
        Ok((Decision::from_allowed(allowed == 1), status))
    }

    async fn rollback(&self, key: &str, window: u64) -> Result<(), Self::Error> {
        let key = self.make_key(key);
        let mut con = self.connection.clone();
        let _: i64 = ROLLBACK_SCRIPT
            .key(key.as_ref())
            .arg(window)
            .invoke_async(&mut con)
            .await?;
        Ok(())
    }

    async fn peek(&self, key: &str, max_requests: u64) -> Result<Option<WindowStatus>, Self::Error> {
        let key = self.make_key(key);
        let mut con = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hget(key.as_ref(), &["count", "window"])
            .pttl(key.as_ref());
        let ((count, window), ttl): ((Option<u64>, Option<u64>), i64) =
            pipe.query_async(&mut con).await?;

        Ok(match (count, window) {
            (Some(count), Some(window)) if ttl > 0 => Some(WindowStatus {
                limit: max_requests,
                remaining: max_requests.saturating_sub(count),
                reset: reset_after(ttl),
                window,
            }),
            _ => None,
        })
    }

    /// Note that the key prefix (if set) is automatically included, you do not need to prepend
    /// it yourself.
    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        let key = self.make_key(key);
        let mut con = self.connection.clone();
        let () = con.del(key.as_ref()).await?;
        Ok(())
    }
}
