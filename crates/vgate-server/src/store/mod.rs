//! Token store: one capability trait, three interchangeable backends.
//!
//! Every backend honours the same contract. A token validates to its bound
//! target until it is revoked or its expiry passes, and never again after.
//! Only the way expiry is detected differs:
//!
//! - **[`memory`]**: lock-guarded map, expired entries dropped lazily on
//!   access and by [`TokenStore::sweep`].
//! - **[`cache`]**: Redis keys written with a native TTL, so entries vanish
//!   without sweeping.
//! - **[`document`]**: SQLite rows carrying an explicit `expires_at` that
//!   every reader compares against the clock.
//!
//! The backend is chosen once by [`open`] and handed around as
//! `Arc<dyn TokenStore>`.

pub mod cache;
pub mod document;
pub mod memory;

pub use cache::RedisTokenStore;
pub use document::SqliteTokenStore;
pub use memory::MemoryTokenStore;

use crate::config::{StoreBackend, StoreConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vgate_core::{GateError, GateResult, Token};

/// How many fresh values `issue` tries before giving up on collisions.
pub(crate) const MAX_ISSUE_ATTEMPTS: usize = 3;

/// Token store failures.
///
/// "Token not found" is never an error: `validate` returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or failed to answer.
    #[error("token store unavailable: {0}")]
    Unavailable(String),

    /// Could not produce a value that does not collide with a live token.
    #[error("could not allocate a unique token after {0} attempts")]
    Exhausted(usize),
}

impl From<StoreError> for GateError {
    fn from(e: StoreError) -> Self {
        GateError::Store(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Issue a new token bound to `target_id`.
    async fn issue(&self, target_id: &str) -> StoreResult<Token>;

    /// Return the bound target if the token exists and has not expired.
    async fn validate(&self, token: &str) -> StoreResult<Option<String>>;

    /// Remove a token. Returns whether a live token was removed.
    async fn revoke(&self, token: &str) -> StoreResult<bool>;

    /// Delete expired entries. Correctness never depends on this running.
    async fn sweep(&self) -> StoreResult<usize> {
        Ok(0)
    }

    /// Lifetime given to newly issued tokens.
    fn ttl(&self) -> Duration;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Build the configured backend.
pub async fn open(config: &StoreConfig) -> GateResult<Arc<dyn TokenStore>> {
    let store: Arc<dyn TokenStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryTokenStore::new(config.ttl)),
        StoreBackend::Redis => Arc::new(
            RedisTokenStore::connect(
                &config.redis_url,
                config.redis_prefix.clone(),
                config.ttl,
                config.redis_op_timeout,
            )
            .await?,
        ),
        StoreBackend::Sqlite => {
            Arc::new(SqliteTokenStore::open(&config.sqlite_path, config.ttl).await?)
        }
    };
    info!(
        backend = store.backend_name(),
        ttl_secs = store.ttl().as_secs(),
        "token store ready"
    );
    Ok(store)
}

/// Run [`TokenStore::sweep`] on an interval until `shutdown` fires.
pub fn spawn_sweeper(
    store: Arc<dyn TokenStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match store.sweep().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "swept expired tokens"),
                        Err(e) => warn!(error = %e, "token sweep failed"),
                    }
                }
            }
        }
        debug!("token sweeper stopped");
    })
}
