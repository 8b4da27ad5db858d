//! Redis-backed token store.
//!
//! Each token is a key `<prefix><value>` holding the target id, written with
//! `SET .. NX PX <ttl>`. Redis expires the key on its own, so this backend
//! never sweeps. Every round-trip is bounded by an operation timeout and any
//! failure surfaces as [`StoreError::Unavailable`].

use super::{StoreError, StoreResult, TokenStore, MAX_ISSUE_ATTEMPTS};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::info;
use vgate_core::{token_prefix, Token};

pub struct RedisTokenStore {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
    op_timeout: Duration,
}

impl RedisTokenStore {
    /// Connect to Redis at `url`.
    pub async fn connect(
        url: &str,
        prefix: String,
        ttl: Duration,
        op_timeout: Duration,
    ) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = bounded(op_timeout, ConnectionManager::new(client)).await?;
        info!(prefix = %prefix, "connected to redis");
        Ok(Self {
            conn,
            prefix,
            ttl,
            op_timeout,
        })
    }

    fn key(&self, token: &str) -> String {
        key_for(&self.prefix, token)
    }
}

fn key_for(prefix: &str, token: &str) -> String {
    format!("{prefix}{token}")
}

/// Await a redis future under `limit`, folding both failure modes into
/// [`StoreError::Unavailable`].
async fn bounded<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StoreError::Unavailable(format!("redis: {e}"))),
        Err(_) => Err(StoreError::Unavailable(format!(
            "redis: no reply within {}ms",
            limit.as_millis()
        ))),
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn issue(&self, target_id: &str) -> StoreResult<Token> {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let token = Token::issue(target_id, self.ttl);
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(self.key(&token.value))
                .arg(target_id)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms);
            // Nil reply means the key already existed.
            let reply: Option<String> = bounded(self.op_timeout, cmd.query_async(&mut conn)).await?;
            if reply.is_some() {
                info!(target_id, token = token_prefix(&token.value), "token issued");
                return Ok(token);
            }
        }
        Err(StoreError::Exhausted(MAX_ISSUE_ATTEMPTS))
    }

    async fn validate(&self, token: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let key = self.key(token);
        let target: Option<String> = bounded(self.op_timeout, conn.get(key)).await?;
        Ok(target)
    }

    async fn revoke(&self, token: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let key = self.key(token);
        let removed: usize = bounded(self.op_timeout, conn.del(key)).await?;
        if removed > 0 {
            info!(token = token_prefix(token), "token revoked");
        }
        Ok(removed > 0)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
