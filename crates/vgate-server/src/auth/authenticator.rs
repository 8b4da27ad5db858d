//! Session authentication: decides whether an upgrade may be relayed.
//!
//! Checks run in a fixed order and stop at the first failure:
//! parameters present, token valid for the requested target, target known.
//! The authenticator never touches the transport; it only returns a decision.

use super::params::UpgradeParams;
use crate::store::{StoreError, TokenStore};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use vgate_core::{token_prefix, CloseReason, TargetEntry, TargetRegistry};

/// Why a token was refused. Clients only ever see one reason for both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRejection {
    /// Never issued, revoked, or expired.
    NotFound,
    /// Valid, but bound to another target.
    TargetMismatch { bound_to: String },
}

/// Outcome of a failed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingParameters,
    InvalidToken(TokenRejection),
    UnknownTarget,
    StoreUnavailable(String),
}

impl Rejection {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::MissingParameters => CloseReason::MissingParameters,
            Self::InvalidToken(_) => CloseReason::InvalidOrExpiredToken,
            Self::UnknownTarget => CloseReason::UnknownTarget,
            Self::StoreUnavailable(_) => CloseReason::StoreUnavailable,
        }
    }

    /// Internal category for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingParameters => "missing_parameters",
            Self::InvalidToken(TokenRejection::NotFound) => "token_not_found",
            Self::InvalidToken(TokenRejection::TargetMismatch { .. }) => "target_mismatch",
            Self::UnknownTarget => "unknown_target",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.close_reason().as_str())
    }
}

/// A session cleared to connect to its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedSession {
    pub token: String,
    pub target: TargetEntry,
}

#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn TokenStore>,
    registry: Arc<TargetRegistry>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn TokenStore>, registry: Arc<TargetRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn authenticate(&self, params: &UpgradeParams) -> Result<AuthorizedSession, Rejection> {
        let result = self.check(params).await;
        match &result {
            Ok(session) => debug!(
                target_id = %session.target.id,
                token = token_prefix(&session.token),
                "session authorized"
            ),
            Err(rejection) => warn!(
                category = rejection.category(),
                server_id = params.server_id.as_deref().unwrap_or(""),
                token = token_prefix(params.token.as_deref().unwrap_or("")),
                detail = ?rejection,
                "session rejected"
            ),
        }
        result
    }

    async fn check(&self, params: &UpgradeParams) -> Result<AuthorizedSession, Rejection> {
        let (token, server_id) = params.require().ok_or(Rejection::MissingParameters)?;

        let bound = match self.store.validate(token).await {
            Ok(Some(bound)) => bound,
            Ok(None) => return Err(Rejection::InvalidToken(TokenRejection::NotFound)),
            Err(StoreError::Unavailable(e)) => return Err(Rejection::StoreUnavailable(e)),
            Err(e) => return Err(Rejection::StoreUnavailable(e.to_string())),
        };
        if bound != server_id {
            return Err(Rejection::InvalidToken(TokenRejection::TargetMismatch {
                bound_to: bound,
            }));
        }

        let target = self
            .registry
            .lookup(server_id)
            .ok_or(Rejection::UnknownTarget)?;

        Ok(AuthorizedSession {
            token: token.to_string(),
            target: target.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryTokenStore, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use vgate_core::Token;

    /// Store that counts calls and can be told to fail.
    struct ProbeStore {
        inner: MemoryTokenStore,
        validations: AtomicUsize,
        fail: bool,
    }

    impl ProbeStore {
        fn new(fail: bool) -> Self {
            Self {
                inner: MemoryTokenStore::new(Duration::from_secs(3600)),
                validations: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl TokenStore for ProbeStore {
        async fn issue(&self, target_id: &str) -> StoreResult<Token> {
            self.inner.issue(target_id).await
        }
        async fn validate(&self, token: &str) -> StoreResult<Option<String>> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.validate(token).await
        }
        async fn revoke(&self, token: &str) -> StoreResult<bool> {
            self.inner.revoke(token).await
        }
        fn ttl(&self) -> Duration {
            self.inner.ttl()
        }
        fn backend_name(&self) -> &'static str {
            "probe"
        }
    }

    fn registry() -> Arc<TargetRegistry> {
        Arc::new(
            TargetRegistry::new(vec![
                TargetEntry::new("vmA", "127.0.0.1", 5900),
                TargetEntry::new("vmB", "127.0.0.1", 5901),
            ])
            .unwrap(),
        )
    }

    fn params(token: &str, server_id: &str) -> UpgradeParams {
        UpgradeParams {
            token: Some(token.to_string()),
            server_id: Some(server_id.to_string()),
        }
    }

    #[tokio::test]
    async fn valid_token_resolves_target() {
        let store = Arc::new(ProbeStore::new(false));
        let auth = Authenticator::new(store.clone(), registry());
        let token = store.issue("vmA").await.unwrap();

        let session = auth.authenticate(&params(&token.value, "vmA")).await.unwrap();
        assert_eq!(session.target.address(), "127.0.0.1:5900");
        assert_eq!(session.token, token.value);
    }

    #[tokio::test]
    async fn missing_parameters_skip_the_store() {
        let store = Arc::new(ProbeStore::new(false));
        let auth = Authenticator::new(store.clone(), registry());

        let err = auth
            .authenticate(&UpgradeParams {
                token: Some("abc".into()),
                server_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::MissingParameters);
        assert_eq!(err.close_reason(), CloseReason::MissingParameters);
        assert_eq!(store.validations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn never_issued_token_is_rejected() {
        let store = Arc::new(ProbeStore::new(false));
        let auth = Authenticator::new(store.clone(), registry());

        let err = auth
            .authenticate(&params(&vgate_core::generate_token_value(), "vmA"))
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::InvalidToken(TokenRejection::NotFound));
        assert_eq!(err.close_reason(), CloseReason::InvalidOrExpiredToken);
        assert_eq!(store.inner.len().await, 0);
    }

    #[tokio::test]
    async fn mismatched_target_shares_the_invalid_reason() {
        let store = Arc::new(ProbeStore::new(false));
        let auth = Authenticator::new(store.clone(), registry());
        let token = store.issue("vmA").await.unwrap();

        let err = auth
            .authenticate(&params(&token.value, "vmB"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "target_mismatch");
        assert_eq!(err.close_reason(), CloseReason::InvalidOrExpiredToken);
    }

    #[tokio::test]
    async fn unregistered_target_is_rejected_even_with_valid_token() {
        let store = Arc::new(ProbeStore::new(false));
        let auth = Authenticator::new(store.clone(), registry());
        let token = store.issue("vmZ").await.unwrap();

        let err = auth
            .authenticate(&params(&token.value, "vmZ"))
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::UnknownTarget);
        assert_eq!(err.close_reason(), CloseReason::UnknownTarget);
    }

    #[tokio::test]
    async fn store_outage_is_not_reported_as_invalid_token() {
        let store = Arc::new(ProbeStore::new(true));
        let auth = Authenticator::new(store.clone(), registry());

        let err = auth
            .authenticate(&params("whatever", "vmA"))
            .await
            .unwrap_err();
        assert!(matches!(err, Rejection::StoreUnavailable(_)));
        assert_eq!(err.close_reason(), CloseReason::StoreUnavailable);
    }

    #[tokio::test]
    async fn revoked_token_is_rejected() {
        let store = Arc::new(ProbeStore::new(false));
        let auth = Authenticator::new(store.clone(), registry());
        let token = store.issue("vmA").await.unwrap();
        store.revoke(&token.value).await.unwrap();

        let err = auth
            .authenticate(&params(&token.value, "vmA"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "token_not_found");
    }
}
