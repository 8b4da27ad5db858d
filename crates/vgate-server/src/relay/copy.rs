//! The two byte-copy directions of a relay session.
//!
//! Each direction forwards opaque chunks verbatim until its source ends or
//! fails, then triggers the shared [`Teardown`]. Both also stop as soon as the
//! teardown fires from elsewhere, including while blocked on a write.

use super::teardown::{CloseCause, Teardown};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

/// Read buffer for the backend → client direction.
pub const BUFFER_SIZE: usize = 8192;

/// Largest binary frame accepted from a client (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Forward binary frames from the client to the backend.
///
/// Returns the number of bytes written to the backend.
pub async fn client_to_backend<St, W>(client: &mut St, backend: &mut W, teardown: &Teardown) -> u64
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut forwarded: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = teardown.done() => break,
            next = client.next() => next,
        };

        let data = match next {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(_))) => {
                debug!("dropping text frame (binary only)");
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "client sent close");
                teardown.trigger(CloseCause::ClientClosed);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                teardown.trigger(classify_ws_error(e));
                break;
            }
            None => {
                teardown.trigger(CloseCause::ClientClosed);
                break;
            }
        };

        if data.len() > MAX_WS_FRAME_SIZE {
            teardown.trigger(CloseCause::ClientError(format!(
                "frame too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                data.len()
            )));
            break;
        }

        let written = tokio::select! {
            _ = teardown.done() => break,
            r = backend.write_all(&data) => r,
        };
        if let Err(e) = written {
            teardown.trigger(CloseCause::BackendError(format!("write: {e}")));
            break;
        }
        trace!(bytes = data.len(), "client → backend");
        forwarded += data.len() as u64;
    }

    forwarded
}

/// Forward backend bytes to the client as binary frames.
///
/// Returns the number of bytes sent to the client.
pub async fn backend_to_client<R, Si>(backend: &mut R, client: &mut Si, teardown: &Teardown) -> u64
where
    R: AsyncRead + Unpin,
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut forwarded: u64 = 0;

    loop {
        let read = tokio::select! {
            _ = teardown.done() => break,
            r = backend.read(&mut buf) => r,
        };

        let n = match read {
            Ok(0) => {
                debug!("backend closed connection");
                teardown.trigger(CloseCause::BackendClosed);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                teardown.trigger(CloseCause::BackendError(format!("read: {e}")));
                break;
            }
        };

        let sent = tokio::select! {
            _ = teardown.done() => break,
            r = client.send(Message::Binary(buf[..n].to_vec().into())) => r,
        };
        if let Err(e) = sent {
            teardown.trigger(CloseCause::ClientError(format!("send: {e}")));
            break;
        }
        trace!(bytes = n, "backend → client");
        forwarded += n as u64;
    }

    forwarded
}

/// Abrupt disconnects are ordinary client departures, not errors.
fn classify_ws_error(e: WsError) -> CloseCause {
    match e {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            debug!(error = %e, "client disconnected");
            CloseCause::ClientClosed
        }
        other => CloseCause::ClientError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio_util::sync::CancellationToken;

    fn teardown() -> Teardown {
        Teardown::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn client_frames_reach_backend_verbatim() {
        let t = teardown();
        let mut client = stream::iter(vec![
            Ok(Message::Binary(b"RFB 003.008\n".to_vec().into())),
            Ok(Message::Text("ignored".into())),
            Ok(Message::Binary(vec![0u8, 1, 2, 255].into())),
            Ok(Message::Close(None)),
        ]);
        let (mut backend, mut far_end) = duplex(1024);

        let n = client_to_backend(&mut client, &mut backend, &t).await;
        assert_eq!(n, 16);
        assert_eq!(t.cause(), Some(CloseCause::ClientClosed));

        drop(backend);
        let mut received = Vec::new();
        far_end.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"RFB 003.008\n\x00\x01\x02\xff");
    }

    #[tokio::test]
    async fn end_of_client_stream_closes() {
        let t = teardown();
        let mut client = stream::iter(Vec::<Result<Message, WsError>>::new());
        let (mut backend, _far) = duplex(64);
        client_to_backend(&mut client, &mut backend, &t).await;
        assert_eq!(t.cause(), Some(CloseCause::ClientClosed));
    }

    #[tokio::test]
    async fn oversized_frame_is_a_client_error() {
        let t = teardown();
        let mut client = stream::iter(vec![Ok(Message::Binary(
            vec![0u8; MAX_WS_FRAME_SIZE + 1].into(),
        ))]);
        let (mut backend, _far) = duplex(64);
        assert_eq!(client_to_backend(&mut client, &mut backend, &t).await, 0);
        assert!(matches!(t.cause(), Some(CloseCause::ClientError(_))));
    }

    #[tokio::test]
    async fn backend_bytes_become_binary_frames() {
        let t = teardown();
        let (mut backend, mut far_end) = duplex(1024);
        far_end.write_all(b"server-init").await.unwrap();
        drop(far_end);

        let mut sink: Vec<Message> = Vec::new();
        let n = backend_to_client(&mut backend, &mut sink, &t).await;
        assert_eq!(n, 11);
        assert_eq!(t.cause(), Some(CloseCause::BackendClosed));
        let bytes: Vec<u8> = sink.into_iter().flat_map(|m| m.into_data().to_vec()).collect();
        assert_eq!(bytes, b"server-init");
    }

    #[tokio::test]
    async fn external_teardown_stops_idle_direction() {
        let t = teardown();
        let (mut backend, _far_end) = duplex(64);
        let mut sink: Vec<Message> = Vec::new();

        let copy = backend_to_client(&mut backend, &mut sink, &t);
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.trigger(CloseCause::TokenInvalidated);
        };
        let (n, ()) = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(copy, trigger)
        })
        .await
        .unwrap();
        assert_eq!(n, 0);
        assert_eq!(t.cause(), Some(CloseCause::TokenInvalidated));
    }

    #[test]
    fn reset_without_close_is_a_departure() {
        assert_eq!(
            classify_ws_error(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
            CloseCause::ClientClosed
        );
        assert!(matches!(
            classify_ws_error(WsError::Io(std::io::Error::other("boom"))),
            CloseCause::ClientError(_)
        ));
    }
}
