//! Shared teardown signal for one relay session.
//!
//! The two copy directions and the expiry watcher all hold the same
//! [`Teardown`]. Whichever unit finishes first records its cause and fires
//! the signal; the others observe it and stop. The first recorded cause wins.

use std::sync::OnceLock;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use vgate_core::CloseReason;

/// Terminal event that ended a relaying session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Client sent a close frame or the stream ended.
    ClientClosed,
    ClientError(String),
    /// Backend reached end-of-stream.
    BackendClosed,
    BackendError(String),
    /// Watcher found the token revoked or expired.
    TokenInvalidated,
    /// Server-wide shutdown.
    Shutdown,
}

impl CloseCause {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::ClientClosed | Self::BackendClosed => CloseReason::Normal,
            Self::ClientError(_) | Self::BackendError(_) => CloseReason::InternalError,
            Self::TokenInvalidated => CloseReason::TokenExpired,
            Self::Shutdown => CloseReason::GoingAway,
        }
    }
}

#[derive(Debug)]
pub struct Teardown {
    done: CancellationToken,
    cause: OnceLock<CloseCause>,
}

impl Teardown {
    /// `done` is normally a child of the server shutdown token, so a
    /// shutdown fires it without recording a cause.
    pub fn new(done: CancellationToken) -> Self {
        Self {
            done,
            cause: OnceLock::new(),
        }
    }

    /// Record `cause` (if none yet) and fire the signal.
    pub fn trigger(&self, cause: CloseCause) {
        let _ = self.cause.set(cause);
        self.done.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }

    /// The winning cause. A signal fired from outside counts as shutdown.
    pub fn cause(&self) -> Option<CloseCause> {
        match self.cause.get() {
            Some(cause) => Some(cause.clone()),
            None if self.done.is_cancelled() => Some(CloseCause::Shutdown),
            None => None,
        }
    }
}
