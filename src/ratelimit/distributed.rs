//! Shared counter backed by Redis.
//!
//! Every process instance increments the same key, so a limit holds across horizontally
//! scaled deployments. The window is anchored at the first request: the key is created
//! with an expiry equal to the window and simply counts until it expires.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::IntoConnectionInfo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use super::backend::CounterBackend;
use super::clock::{Clock, SystemClock};
use super::decision::{BackendKind, Decision};
use super::identifier::Identifier;
use super::policy::{Category, RateLimitPolicy};
use crate::config::StoreConfig;
use crate::error::Result;

/// Atomic increment-with-expiry.
///
/// Returns the post-increment count and the key's remaining time to live in
/// milliseconds. A key that somehow lost its expiry is re-armed so it cannot count forever.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Bound on a single connection attempt when none is configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// A window counter stored in Redis.
///
/// The client is built once from configuration. The connection itself is opened on first
/// use with a single attempt; if it fails, the next call tries again.
pub struct RedisCounter {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    script: redis::Script,
    key_prefix: String,
    connect_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RedisCounter {
    /// Create a counter for the store at `url`, authenticating with `token`.
    pub fn new(url: &str, token: &str, key_prefix: &str) -> Result<Self> {
        let mut info = url.into_connection_info()?;
        info.redis.password = Some(token.to_string());

        let client = redis::Client::open(info)?;
        info!(prefix = %key_prefix, "Shared counter store client created");

        Ok(Self::with_client(client, key_prefix))
    }

    /// Create a counter around an already opened client.
    pub fn with_client(client: redis::Client, key_prefix: &str) -> Self {
        Self {
            client,
            connection: OnceCell::new(),
            script: redis::Script::new(INCREMENT_SCRIPT),
            key_prefix: key_prefix.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a counter from configuration.
    ///
    /// Returns `Ok(None)` when the endpoint or credential is missing: the shared store is
    /// then disabled for the life of the process.
    pub fn from_config(config: &StoreConfig) -> Result<Option<Self>> {
        match config.credentials() {
            Some((url, token)) => Self::new(url, token, &config.key_prefix)
                .map(|counter| Some(counter.with_connect_timeout(config.timeout()))),
            None => {
                debug!("Shared counter store not configured");
                Ok(None)
            }
        }
    }

    /// Replace the clock used to turn TTLs into reset times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound each connection attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The store key for a category and caller, `prefix:category:identifier`.
    pub fn key(&self, category: Category, identifier: &Identifier) -> String {
        format!("{}:{}:{}", self.key_prefix, category, identifier)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                // A refused connection must fail now rather than back off inside the check
                let config = ConnectionManagerConfig::new()
                    .set_number_of_retries(0)
                    .set_connection_timeout(self.connect_timeout);
                let manager = self
                    .client
                    .get_connection_manager_with_config(config)
                    .await?;
                info!("Connected to shared counter store");
                Ok::<_, crate::error::TollgateError>(manager)
            })
            .await?;

        Ok(connection.clone())
    }

    /// Increment `key`, creating it with a `window_seconds` expiry if absent.
    ///
    /// Returns the resulting count and the remaining time to live in milliseconds.
    pub async fn increment(&self, key: &str, window_seconds: u64) -> Result<(u64, u64)> {
        let mut connection = self.connection().await?;
        let window_ms = window_seconds.saturating_mul(1000);

        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut connection)
            .await?;

        Ok((count.max(0) as u64, ttl_ms.max(0) as u64))
    }
}

#[async_trait]
impl CounterBackend for RedisCounter {
    async fn hit(&self, policy: &RateLimitPolicy, identifier: &Identifier) -> Result<Decision> {
        let key = self.key(policy.category, identifier);
        let (count, ttl_ms) = self.increment(&key, policy.window_seconds).await?;

        trace!(key = %key, count, ttl_ms, limit = policy.limit, "Shared counter incremented");

        let reset_at = self.clock.now() + chrono::Duration::milliseconds(ttl_ms as i64);
        Ok(Decision::from_count(
            count,
            policy.limit,
            reset_at,
            BackendKind::Distributed,
        ))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }
}
