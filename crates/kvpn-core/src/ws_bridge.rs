//! Adapts a WebSocket connection into a plain [`crate::transport::Connection`]
//! (`AsyncRead + AsyncWrite`): each binary frame carries a slice of the
//! underlying byte stream, symmetrically on both ends.
//!
//! Rather than hand-rolling a `poll_read`/`poll_write` state machine over
//! the WS sink/stream, this spawns a small pump task and hands the caller
//! one half of a `tokio::io::duplex` pipe.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Binary WS frames larger than this are rejected; the connection is
/// dropped rather than buffering an unbounded frame.
const MAX_WS_FRAME_SIZE: usize = 1024 * 1024;
const PUMP_BUFFER: usize = 64 * 1024;

/// One side of a pumped WebSocket connection. Reading yields the payload
/// of inbound binary frames; writing is batched into outbound binary
/// frames by the pump task.
pub struct WsByteStream {
    inner: DuplexStream,
}

impl WsByteStream {
    pub fn new(ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>) -> Self {
        let (client, server) = tokio::io::duplex(PUMP_BUFFER);
        tokio::spawn(pump(ws, server));
        Self { inner: client }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Shuttles bytes between the WS connection and the duplex pipe until
/// either side closes.
async fn pump(
    mut ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    mut pipe: DuplexStream,
) {
    let mut read_buf = vec![0u8; PUMP_BUFFER];
    loop {
        tokio::select! {
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > MAX_WS_FRAME_SIZE {
                            debug!(len = data.len(), "oversized ws frame, dropping connection");
                            break;
                        }
                        if tokio::io::AsyncWriteExt::write_all(&mut pipe, &data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "ws read error");
                        break;
                    }
                }
            }
            n = tokio::io::AsyncReadExt::read(&mut pipe, &mut read_buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if ws.send(Message::Binary(read_buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    let _ = ws.close(None).await;
}
