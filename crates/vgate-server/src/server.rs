//! Core server: binds both listeners and dispatches relay sessions.
//!
//! Owns the token store, target registry and session registry. Every session
//! runs on its own task with a child of the server shutdown token, and the
//! server waits for all of them before reporting itself stopped.

use crate::api::{self, AppState};
use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::relay::{run_session, turn_away, RelayContext, SessionRegistry, TcpDialer};
use crate::store::{self, TokenStore};
use crate::transport::{websocket, WebSocketConnection};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use vgate_core::{CloseReason, GateError, GateResult, TargetRegistry};

/// The gateway server instance.
pub struct GateServer {
    config: ServerConfig,
    store: Arc<dyn TokenStore>,
    targets: Arc<TargetRegistry>,
    sessions: Arc<SessionRegistry>,
}

/// A started server. Dropping it does not stop anything; cancel the
/// shutdown token and call [`RunningServer::wait`].
pub struct RunningServer {
    pub ws_addr: SocketAddr,
    pub api_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningServer {
    /// Wait until the accept loop, every session, the API and the sweeper
    /// have stopped.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "server task failed");
        }
    }
}

impl GateServer {
    pub fn new(config: ServerConfig, store: Arc<dyn TokenStore>) -> Self {
        let targets = Arc::new(config.targets.clone());
        Self {
            config,
            store,
            targets,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    /// Bind the relay and API listeners and start serving in the background.
    pub async fn start(self, shutdown: CancellationToken) -> GateResult<RunningServer> {
        let ws_bind = socket_addr(&self.config.bind, self.config.ws_port)?;
        let api_bind = socket_addr(&self.config.bind, self.config.api_port)?;

        let authenticator = Authenticator::new(self.store.clone(), self.targets.clone());

        let api_listener = TcpListener::bind(api_bind)
            .await
            .map_err(|e| GateError::Transport(format!("API bind {api_bind} failed: {e}")))?;
        let api_addr = api_listener.local_addr()?;

        let (ws_addr, mut ws_rx) =
            websocket::start_listener(ws_bind, self.config.handshake_timeout, shutdown.clone())
                .await?;

        let api_state = AppState {
            store: self.store.clone(),
            targets: self.targets.clone(),
            authenticator: authenticator.clone(),
            sessions: self.sessions.clone(),
        };
        let api_task = tokio::spawn(api::serve(api_listener, api_state, shutdown.clone()));
        info!(addr = %api_addr, "HTTP API started");

        let sweeper = store::spawn_sweeper(
            self.store.clone(),
            self.config.store.sweep_interval,
            shutdown.clone(),
        );

        let ctx = Arc::new(RelayContext {
            authenticator,
            store: self.store.clone(),
            dialer: Arc::new(TcpDialer),
            connect_timeout: self.config.connect_timeout,
            watch_interval: self.config.watch_interval,
            sessions: self.sessions.clone(),
        });

        if self.targets.is_empty() {
            warn!("no targets configured, every upgrade will be rejected");
        }
        info!(
            ws = %ws_addr,
            api = %api_addr,
            store = self.store.backend_name(),
            targets = self.targets.len(),
            watch_interval_ms = self.config.watch_interval.as_millis() as u64,
            "vgate ready"
        );

        let sessions = self.sessions.clone();
        let task = tokio::spawn(async move {
            let tracker = TaskTracker::new();
            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    conn = ws_rx.recv() => conn,
                };
                let Some(conn) = conn else {
                    info!("WebSocket listener closed");
                    break;
                };
                let ctx = ctx.clone();
                let done = shutdown.child_token();
                tracker.spawn(async move {
                    let remote = conn.remote_addr;
                    match run_session(ctx, conn, done).await {
                        Ok(reason) => debug!(remote = %remote, code = reason.code(), "session ended"),
                        Err(e) => warn!(remote = %remote, error = %e, "session error"),
                    }
                });
            }

            turn_away_queued(&mut ws_rx, &tracker).await;
            tracker.close();
            let active = sessions.count().await;
            info!(active, "waiting for sessions to close");
            tracker.wait().await;

            if let Err(e) = sweeper.await {
                warn!(error = %e, "sweeper task failed");
            }
            match api_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "API server error"),
                Err(e) => warn!(error = %e, "API task failed"),
            }
            info!("all sessions closed");
        });

        Ok(RunningServer {
            ws_addr,
            api_addr,
            task,
        })
    }
}

/// Close connections that were upgraded but not yet dispatched when the
/// accept loop stopped.
async fn turn_away_queued(
    ws_rx: &mut mpsc::Receiver<WebSocketConnection>,
    tracker: &TaskTracker,
) -> usize {
    ws_rx.close();
    let mut turned_away = 0;
    while let Some(conn) = ws_rx.recv().await {
        let remote = conn.remote_addr;
        tracker.spawn(async move {
            turn_away(conn, CloseReason::GoingAway).await;
            debug!(remote = %remote, "queued connection turned away");
        });
        turned_away += 1;
    }
    turned_away
}

fn socket_addr(bind: &str, port: u16) -> GateResult<SocketAddr> {
    let ip: IpAddr = bind
        .trim_matches(|c| c == '[' || c == ']')
        .parse()
        .map_err(|e| GateError::Config(format!("invalid bind address {bind:?}: {e}")))?;
    Ok(SocketAddr::new(ip, port))
}
