//! Expiry watcher: re-validates a relaying session's token on an interval.
//!
//! This is the only component allowed to end a session from outside its own
//! I/O. A definitive "not found" (or a token now bound elsewhere) triggers
//! teardown with [`CloseCause::TokenInvalidated`]. A store error is treated as
//! a transient blip and retried on the next tick.

use super::teardown::{CloseCause, Teardown};
use crate::store::TokenStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vgate_core::token_prefix;

/// How a watcher finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The token stopped validating; teardown was triggered.
    Invalidated,
    /// The session ended for another reason first.
    Stopped,
}

pub struct ExpiryWatcher {
    store: Arc<dyn TokenStore>,
    token: String,
    target_id: String,
    interval: Duration,
}

impl ExpiryWatcher {
    pub fn new(
        store: Arc<dyn TokenStore>,
        token: impl Into<String>,
        target_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            token: token.into(),
            target_id: target_id.into(),
            interval,
        }
    }

    /// Run the watcher on its own task until the session's teardown fires.
    pub fn spawn(self, teardown: Arc<Teardown>) -> JoinHandle<WatchOutcome> {
        tokio::spawn(async move { self.run(&teardown).await })
    }

    pub async fn run(self, teardown: &Teardown) -> WatchOutcome {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The authenticator validated just now; skip the immediate tick.
        ticker.tick().await;

        let mut consecutive_failures: u32 = 0;
        loop {
            tokio::select! {
                _ = teardown.done() => break,
                _ = ticker.tick() => {}
            }

            let checked = tokio::select! {
                _ = teardown.done() => break,
                r = self.store.validate(&self.token) => r,
            };

            match checked {
                Ok(Some(bound)) if bound == self.target_id => {
                    if consecutive_failures > 0 {
                        debug!(failures = consecutive_failures, "token store reachable again");
                    }
                    consecutive_failures = 0;
                }
                Ok(_) => {
                    info!(
                        target_id = %self.target_id,
                        token = token_prefix(&self.token),
                        "token no longer valid, ending session"
                    );
                    teardown.trigger(CloseCause::TokenInvalidated);
                    return WatchOutcome::Invalidated;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        error = %e,
                        failures = consecutive_failures,
                        token = token_prefix(&self.token),
                        "token re-check failed, retrying next interval"
                    );
                }
            }
        }

        debug!(token = token_prefix(&self.token), "expiry watcher stopped");
        WatchOutcome::Stopped
    }
}
