//! WebSocket listener using tokio-tungstenite.
//!
//! Every accepted TCP connection gets its own handshake task, bounded by the
//! configured handshake timeout. The request target (path plus query) is
//! captured during the handshake so the authenticator can read the token
//! and target identifier from it.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vgate_core::{GateError, GateResult};

use crate::relay::copy::MAX_WS_FRAME_SIZE;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Path and query of the upgrade request, e.g. `/?token=..&serverID=vm1`.
    pub request_target: String,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections. The accept loop ends when `shutdown` fires, which closes
/// the receiver.
pub async fn start_listener(
    bind_addr: SocketAddr,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> GateResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Transport(format!("WS bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(handshake_timeout, upgrade(stream)).await {
                            Ok(Ok((ws_stream, request_target))) => {
                                debug!(remote = %addr, target = %redact(&request_target), "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    request_target,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Ok(Err(e)) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                            Err(_) => {
                                warn!(remote = %addr, "WebSocket handshake timed out");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        info!(addr = %local_addr, "WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

async fn upgrade(stream: TcpStream) -> GateResult<(WebSocketStream<TcpStream>, String)> {
    let (target_tx, target_rx) = oneshot::channel::<String>();
    let capture = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        let _ = target_tx.send(target);
        Ok(resp)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_WS_FRAME_SIZE);
    ws_config.max_frame_size = Some(MAX_WS_FRAME_SIZE);

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(stream, capture, Some(ws_config))
        .await
        .map_err(|e| GateError::Transport(format!("WS upgrade failed: {e}")))?;
    let request_target = target_rx.await.unwrap_or_else(|_| "/".to_string());
    Ok((ws_stream, request_target))
}

/// Request target with the query string elided, for logs.
fn redact(target: &str) -> &str {
    target.split_once('?').map_or(target, |(path, _)| path)
}
