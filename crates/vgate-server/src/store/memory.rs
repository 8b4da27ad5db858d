//! In-process token store.
//!
//! A single `RwLock`-guarded map holds every live token. Readers that find an
//! expired entry upgrade to the write lock and drop it, so an expired token
//! can never validate even if the sweeper has not run yet.

use super::{StoreError, StoreResult, TokenStore, MAX_ISSUE_ATTEMPTS};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use vgate_core::{token_prefix, unix_millis, Token};

pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, Token>>,
    ttl: Duration,
}

impl MemoryTokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Number of entries currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn issue(&self, target_id: &str) -> StoreResult<Token> {
        let mut tokens = self.tokens.write().await;
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let token = Token::issue(target_id, self.ttl);
            if tokens.contains_key(&token.value) {
                continue;
            }
            tokens.insert(token.value.clone(), token.clone());
            info!(target_id, token = token_prefix(&token.value), "token issued");
            return Ok(token);
        }
        Err(StoreError::Exhausted(MAX_ISSUE_ATTEMPTS))
    }

    async fn validate(&self, token: &str) -> StoreResult<Option<String>> {
        let now = unix_millis();
        {
            let tokens = self.tokens.read().await;
            match tokens.get(token) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired_at(now) => {
                    return Ok(Some(entry.target_id.clone()));
                }
                Some(_) => {}
            }
        }

        // Expired: drop it, re-checking under the write lock.
        let mut tokens = self.tokens.write().await;
        if tokens
            .get(token)
            .is_some_and(|entry| entry.is_expired_at(now))
        {
            tokens.remove(token);
            debug!(token = token_prefix(token), "dropped expired token");
        }
        Ok(None)
    }

    async fn revoke(&self, token: &str) -> StoreResult<bool> {
        let mut tokens = self.tokens.write().await;
        match tokens.remove(token) {
            Some(entry) => {
                let live = !entry.is_expired_at(unix_millis());
                info!(
                    target_id = %entry.target_id,
                    token = token_prefix(token),
                    "token revoked"
                );
                Ok(live)
            }
            None => Ok(false),
        }
    }

    async fn sweep(&self) -> StoreResult<usize> {
        let now = unix_millis();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, entry| !entry.is_expired_at(now));
        Ok(before - tokens.len())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
