//! HTTP control API: token issuance, revocation, access checks, listings.

use crate::auth::{Authenticator, Rejection, UpgradeParams};
use crate::relay::SessionRegistry;
use crate::store::{StoreError, TokenStore};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vgate_core::{token_prefix, unix_millis, GateError, GateResult, TargetRegistry};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TokenStore>,
    pub targets: Arc<TargetRegistry>,
    pub authenticator: Authenticator,
    pub sessions: Arc<SessionRegistry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenTokenRequest {
    #[serde(default, alias = "targetId")]
    pub node_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenTokenResponse {
    pub token: String,
    pub target_id: String,
    pub expires_in_seconds: u64,
}

fn error(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/gentoken", post(gentoken))
        .route("/api/access", get(access))
        .route("/api/token/{token}", delete(revoke))
        .route("/api/sessions", get(sessions))
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> GateResult<()> {
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| GateError::Transport(format!("API server failed: {e}")))
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "vgate" }))
}

/// `POST /api/gentoken` with `{"nodeId": ".."}`.
pub async fn gentoken(
    State(state): State<AppState>,
    payload: Result<Json<GenTokenRequest>, JsonRejection>,
) -> Response {
    let node_id = match payload {
        Ok(Json(GenTokenRequest { node_id: Some(id) })) if !id.trim().is_empty() => id,
        Ok(_) => return error(StatusCode::BAD_REQUEST, "missing_nodeId"),
        Err(e) => {
            warn!(error = %e, "malformed gentoken body");
            return error(StatusCode::BAD_REQUEST, "missing_nodeId");
        }
    };

    if !state.targets.contains(&node_id) {
        warn!(node_id = %node_id, "token requested for unknown target");
        return error(StatusCode::NOT_FOUND, "invalid_nodeId");
    }

    match state.store.issue(&node_id).await {
        Ok(token) => {
            debug!(
                target_id = %token.target_id,
                token = token_prefix(&token.value),
                backend = state.store.backend_name(),
                "gentoken served"
            );
            let expires_in_seconds = token.expires_in_secs(unix_millis());
            Json(GenTokenResponse {
                token: token.value,
                target_id: token.target_id,
                expires_in_seconds,
            })
            .into_response()
        }
        Err(e) => {
            warn!(error = %e, node_id = %node_id, "token issuance failed");
            error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
        }
    }
}

/// `GET /api/access?serverID=..&token=..`: the upgrade check without the upgrade.
pub async fn access(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = UpgradeParams::parse("/api/access", query.as_deref());
    match state.authenticator.authenticate(&params).await {
        Ok(session) => (
            StatusCode::OK,
            Json(json!({ "status": "connected", "serverId": session.target.id })),
        )
            .into_response(),
        Err(rejection) => {
            let status = match rejection {
                Rejection::MissingParameters => StatusCode::BAD_REQUEST,
                Rejection::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::FORBIDDEN,
            };
            error(status, rejection.close_reason().as_str())
        }
    }
}

/// `DELETE /api/token/{token}`
pub async fn revoke(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.store.revoke(&token).await {
        Ok(true) => {
            debug!(token = token_prefix(&token), "revoke served");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error(StatusCode::NOT_FOUND, "not_found"),
        Err(StoreError::Unavailable(e)) => {
            warn!(error = %e, "token revocation failed");
            error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
        }
        Err(e) => {
            warn!(error = %e, "token revocation failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

/// `GET /api/sessions`
pub async fn sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.list().await;
    Json(json!({ "count": sessions.len(), "sessions": sessions }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryTokenStore, StoreResult};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;
    use vgate_core::{TargetEntry, Token};

    fn state_with(store: Arc<dyn TokenStore>) -> AppState {
        let targets = Arc::new(
            TargetRegistry::new(vec![
                TargetEntry::new("vm1", "localhost", 5900),
                TargetEntry::new("vm2", "localhost", 5901),
            ])
            .unwrap(),
        );
        AppState {
            authenticator: Authenticator::new(store.clone(), targets.clone()),
            store,
            targets,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    fn memory_state() -> AppState {
        state_with(Arc::new(MemoryTokenStore::new(Duration::from_secs(3600))))
    }

    /// Store that is always unreachable.
    struct DownStore;

    #[async_trait]
    impl TokenStore for DownStore {
        async fn issue(&self, _: &str) -> StoreResult<Token> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn validate(&self, _: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn revoke(&self, _: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn ttl(&self) -> Duration {
            Duration::from_secs(60)
        }
        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    /// Send a request to the app and return (status, parsed JSON body).
    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn gentoken_req(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/gentoken")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = send(&memory_state(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "vgate");
    }

    #[tokio::test]
    async fn gentoken_issues_bound_token() {
        let state = memory_state();
        let (status, body) = send(&state, gentoken_req(r#"{"nodeId":"vm1"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["targetId"], "vm1");
        assert_eq!(body["expiresInSeconds"], 3600);
        let token = body["token"].as_str().unwrap();
        assert_eq!(token.len(), 64);
        assert_eq!(state.store.validate(token).await.unwrap().as_deref(), Some("vm1"));
    }

    #[tokio::test]
    async fn gentoken_accepts_target_id_alias() {
        let (status, body) = send(&memory_state(), gentoken_req(r#"{"targetId":"vm2"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["targetId"], "vm2");
    }

    #[tokio::test]
    async fn gentoken_rejects_missing_or_unknown() {
        let state = memory_state();
        for body in [r#"{}"#, r#"{"nodeId":""}"#, "not json"] {
            let (status, json) = send(&state, gentoken_req(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
            assert_eq!(json["error"], "missing_nodeId");
        }

        let (status, json) = send(&state, gentoken_req(r#"{"nodeId":"vm9"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "invalid_nodeId");
    }

    #[tokio::test]
    async fn gentoken_reports_store_outage() {
        let state = state_with(Arc::new(DownStore));
        let (status, json) = send(&state, gentoken_req(r#"{"nodeId":"vm1"}"#)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "store_unavailable");
    }

    #[tokio::test]
    async fn access_mirrors_upgrade_checks() {
        let state = memory_state();
        let token = state.store.issue("vm1").await.unwrap();

        let (status, json) = send(
            &state,
            get(&format!("/api/access?serverID=vm1&token={}", token.value)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["serverId"], "vm1");

        let (status, json) = send(
            &state,
            get(&format!("/api/access?serverID=vm2&token={}", token.value)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"], "invalid_or_expired_token");

        let (status, _) = send(&state, get("/api/access?serverID=vm1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let down = state_with(Arc::new(DownStore));
        let (status, json) = send(&down, get("/api/access?serverID=vm1&token=abc")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "store_unavailable");
    }

    #[tokio::test]
    async fn revoke_then_revoke_again() {
        let state = memory_state();
        let token = state.store.issue("vm1").await.unwrap();
        let delete = |t: &str| {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/token/{t}"))
                .body(Body::empty())
                .unwrap()
        };

        let (status, _) = send(&state, delete(&token.value)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.store.validate(&token.value).await.unwrap(), None);

        let (status, json) = send(&state, delete(&token.value)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn sessions_listing_starts_empty() {
        let (status, json) = send(&memory_state(), get("/api/sessions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 0);
        assert!(json["sessions"].as_array().unwrap().is_empty());
    }
}
