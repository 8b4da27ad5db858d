//! Drives one accepted connection through its whole lifecycle.
//!
//! Authentication, backend connect, the two copy directions, the expiry
//! watcher and the final close all happen here. Every state change is
//! mirrored into the [`SessionRegistry`].

use super::copy;
use super::session::{Session, SessionRegistry, SessionState};
use super::teardown::{CloseCause, Teardown};
use super::watcher::ExpiryWatcher;
use crate::auth::{Authenticator, UpgradeParams};
use crate::store::TokenStore;
use crate::transport::WebSocketConnection;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vgate_core::{token_prefix, CloseReason, GateResult};

/// Upper bound on sending the close frame to a client.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens the TCP connection to a target's backend.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, address: &str) -> io::Result<TcpStream>;
}

/// Plain TCP connect.
pub struct TcpDialer;

#[async_trait]
impl Dial for TcpDialer {
    async fn dial(&self, address: &str) -> io::Result<TcpStream> {
        TcpStream::connect(address).await
    }
}

/// Everything a session needs besides its own sockets.
pub struct RelayContext {
    pub authenticator: Authenticator,
    pub store: Arc<dyn TokenStore>,
    pub dialer: Arc<dyn Dial>,
    pub connect_timeout: Duration,
    pub watch_interval: Duration,
    pub sessions: Arc<SessionRegistry>,
}

/// Sockets owned by a session, each closed at most once.
pub struct SessionSockets<C, B> {
    client: Option<C>,
    backend: Option<B>,
}

impl<C, B> SessionSockets<C, B>
where
    C: Sink<Message> + Unpin,
    B: AsyncWrite + Unpin,
{
    pub fn new(client: C, backend: Option<B>) -> Self {
        Self {
            client: Some(client),
            backend,
        }
    }

    /// Shut down the backend write side and send a close frame carrying
    /// `reason`. Later calls do nothing. Errors from peers that are already
    /// gone are ignored, and a client that does not take the close frame
    /// within [`CLOSE_TIMEOUT`] is dropped without it.
    pub async fn close(&mut self, reason: CloseReason) -> bool {
        let mut closed_any = false;
        if let Some(mut backend) = self.backend.take() {
            let _ = backend.shutdown().await;
            closed_any = true;
        }
        if let Some(mut client) = self.client.take() {
            let goodbye = async {
                let _ = client.send(close_message(reason)).await;
                let _ = client.close().await;
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, goodbye).await.is_err() {
                debug!(code = reason.code(), "client not reading, dropped without close frame");
            }
            closed_any = true;
        }
        closed_any
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none() && self.backend.is_none()
    }
}

pub fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.as_str().into(),
    }))
}

/// Close a connection that never became a session.
pub async fn turn_away(conn: WebSocketConnection, reason: CloseReason) {
    SessionSockets::<_, TcpStream>::new(conn.ws_stream, None)
        .close(reason)
        .await;
}

/// Run a session to completion and return the close reason sent to the
/// client.
///
/// `done` becomes the session's teardown signal. Pass a child of the server
/// shutdown token so a shutdown closes the session with `going_away`, also
/// while it is still authenticating or connecting.
pub async fn run_session(
    ctx: Arc<RelayContext>,
    conn: WebSocketConnection,
    done: CancellationToken,
) -> GateResult<CloseReason> {
    let WebSocketConnection {
        ws_stream,
        remote_addr,
        request_target,
    } = conn;

    let mut session = Session::new(remote_addr);
    session.advance(SessionState::Authenticating)?;
    ctx.sessions.update(&session).await;

    let params = UpgradeParams::from_request_target(&request_target);
    let authenticated = tokio::select! {
        _ = done.cancelled() => {
            return reject(&ctx, &mut session, ws_stream, CloseReason::GoingAway).await;
        }
        authenticated = ctx.authenticator.authenticate(&params) => authenticated,
    };
    let authorized = match authenticated {
        Ok(authorized) => authorized,
        Err(rejection) => {
            return reject(&ctx, &mut session, ws_stream, rejection.close_reason()).await;
        }
    };

    session.bind(&authorized.target.id);
    session.advance(SessionState::Connecting)?;
    ctx.sessions.update(&session).await;

    let address = authorized.target.address();
    let dialed = tokio::select! {
        _ = done.cancelled() => {
            return reject(&ctx, &mut session, ws_stream, CloseReason::GoingAway).await;
        }
        dialed = tokio::time::timeout(ctx.connect_timeout, ctx.dialer.dial(&address)) => dialed,
    };
    let backend = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(session_id = %session.id, target_id = %authorized.target.id, %address, error = %e, "backend connect failed");
            return reject(&ctx, &mut session, ws_stream, CloseReason::BackendUnavailable).await;
        }
        Err(_) => {
            warn!(
                session_id = %session.id,
                target_id = %authorized.target.id,
                %address,
                timeout_ms = ctx.connect_timeout.as_millis() as u64,
                "backend connect timed out"
            );
            return reject(&ctx, &mut session, ws_stream, CloseReason::BackendUnavailable).await;
        }
    };
    let _ = backend.set_nodelay(true);

    session.advance(SessionState::Relaying)?;
    ctx.sessions.update(&session).await;
    info!(
        session_id = %session.id,
        remote = %remote_addr,
        target_id = %authorized.target.id,
        %address,
        token = token_prefix(&authorized.token),
        "relay started"
    );

    let started = Instant::now();
    let teardown = Arc::new(Teardown::new(done));
    let watcher = ExpiryWatcher::new(
        ctx.store.clone(),
        authorized.token.clone(),
        authorized.target.id.clone(),
        ctx.watch_interval,
    )
    .spawn(teardown.clone());

    let (mut client_tx, mut client_rx) = ws_stream.split();
    let (mut backend_rx, mut backend_tx) = backend.into_split();
    let (up, down) = tokio::join!(
        copy::client_to_backend(&mut client_rx, &mut backend_tx, &teardown),
        copy::backend_to_client(&mut backend_rx, &mut client_tx, &teardown),
    );
    if let Err(e) = watcher.await {
        warn!(session_id = %session.id, error = %e, "expiry watcher task failed");
    }

    session.advance(SessionState::Closing)?;
    ctx.sessions.update(&session).await;

    let cause = teardown.cause().unwrap_or(CloseCause::Shutdown);
    let reason = cause.close_reason();
    let mut sockets = SessionSockets::new(client_tx, Some(backend_tx));
    sockets.close(reason).await;
    drop(backend_rx);
    drop(client_rx);

    session.advance(SessionState::Closed)?;
    ctx.sessions.update(&session).await;
    info!(
        session_id = %session.id,
        target_id = %authorized.target.id,
        ?cause,
        code = reason.code(),
        bytes_up = up,
        bytes_down = down,
        duration_ms = started.elapsed().as_millis() as u64,
        "relay closed"
    );

    Ok(reason)
}

async fn reject<S>(
    ctx: &RelayContext,
    session: &mut Session,
    ws_stream: S,
    reason: CloseReason,
) -> GateResult<CloseReason>
where
    S: Sink<Message> + Unpin,
{
    session.advance(SessionState::Rejected)?;
    SessionSockets::<_, TcpStream>::new(ws_stream, None)
        .close(reason)
        .await;
    ctx.sessions.update(session).await;
    debug!(session_id = %session.id, code = reason.code(), "session rejected");
    Ok(reason)
}
