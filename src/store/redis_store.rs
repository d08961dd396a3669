//! Redis-backed window store.
//!
//! Each bucket is a sorted set scored by admission time. The whole
//! prune/count/insert/decide sequence runs as one Lua script, and Redis
//! executes scripts one at a time, so two processes racing on the same key
//! are serialized by the store itself. No retry loop is needed and the
//! worst case is a single round trip.
//!
//! The connection is established lazily on first use so an unreachable
//! Redis at startup degrades through the fail-open guard instead of
//! aborting the process.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use tokio::sync::OnceCell;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ratelimit::{RateLimitKey, WindowOutcome, WindowStore};

/// Name and version of the atomic evaluation script.
pub const SCRIPT_NAME: &str = "sliding_window_v1";

const SLIDING_WINDOW_V1: &str = include_str!("sliding_window_v1.lua");

/// Window store backed by a shared Redis instance.
pub struct RedisWindowStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
}

impl fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("script", &SCRIPT_NAME)
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Create a store for the given Redis URL.
    ///
    /// Only parses the URL; no connection is made until the first
    /// evaluation.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(SLIDING_WINDOW_V1),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to Redis window store");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(conn.clone())
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("PING answered '{}'", reply)))
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn evaluate_window(
        &self,
        key: &RateLimitKey,
        window_millis: u64,
        max_requests: u32,
    ) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.connection().await?;

        // Entries sharing a millisecond must stay distinct set members.
        let member = Uuid::new_v4().simple().to_string();

        let reply: (i64, i64, i64, i64) = self
            .script
            .key(key.as_str())
            .arg(window_millis)
            .arg(max_requests)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let outcome = decode_reply(reply)?;
        trace!(
            key = %key,
            script = SCRIPT_NAME,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Evaluated Redis window"
        );
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn decode_reply(reply: (i64, i64, i64, i64)) -> Result<WindowOutcome, StoreError> {
    let (allowed, remaining, oldest, now) = reply;

    let allowed = match allowed {
        0 => false,
        1 => true,
        other => {
            return Err(StoreError::Protocol(format!(
                "{} returned allowed={}",
                SCRIPT_NAME, other
            )))
        }
    };
    let remaining = u32::try_from(remaining).map_err(|_| {
        StoreError::Protocol(format!("{} returned remaining={}", SCRIPT_NAME, remaining))
    })?;
    let now_millis = u64::try_from(now)
        .map_err(|_| StoreError::Protocol(format!("{} returned now={}", SCRIPT_NAME, now)))?;
    let oldest_millis = u64::try_from(oldest).ok();

    Ok(WindowOutcome {
        allowed,
        remaining,
        oldest_millis,
        now_millis,
    })
}
