//! First-byte protocol dispatch.
//!
//! Wraps the raw connection in a small buffered peek adapter so detection
//! never consumes bytes the dispatched handler still needs to see, mirrors
//! `dispatch_message`'s match-based routing in shape (one branch per
//! recognized discriminant, explicit default), but the discriminant here
//! is a wire byte instead of a message type tag.

use crate::error::HandlerResult;
use crate::options::HandlerOptions;
use crate::socks5::Socks5Handler;
use kvpn_core::BoxedConn;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

const SOCKS5_VERSION: u8 = 0x05;

/// Reads exactly one byte ahead of the wrapped connection and replays it
/// before any further reads, so peeking the protocol discriminant is
/// non-destructive.
struct PeekedConn {
    peeked: Option<u8>,
    inner: BoxedConn,
}

impl AsyncRead for PeekedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(byte) = self.peeked.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeekedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Server-side entry point: peek one byte, dispatch to the matching
/// protocol handler, or fall through to probe resistance / close.
pub struct AutoHandler {
    options: HandlerOptions,
}

impl AutoHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self { options }
    }

    pub async fn handle(&self, conn: BoxedConn) -> HandlerResult<()> {
        let mut raw = match &self.options.tls_config {
            Some(tls_config) => {
                let acceptor = tokio_rustls::TlsAcceptor::from(tls_config.clone());
                match acceptor.accept(conn).await {
                    Ok(tls_stream) => Box::new(tls_stream) as BoxedConn,
                    Err(e) => {
                        debug!(error = %e, "tls handshake failed, closing connection");
                        return Ok(());
                    }
                }
            }
            None => conn,
        };
        let mut probe = [0u8; 1];
        let n = match tokio::io::AsyncReadExt::read(&mut raw, &mut probe).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "peek failed, closing connection");
                return Ok(());
            }
        };
        if n == 0 {
            debug!("connection closed before any byte was sent");
            return Ok(());
        }

        let peeked: BoxedConn = Box::new(PeekedConn {
            peeked: Some(probe[0]),
            inner: raw,
        });

        match probe[0] {
            SOCKS5_VERSION => {
                let handler = Socks5Handler::new(&self.options);
                handler.handle(peeked).await
            }
            other => {
                if let Some(host) = &self.options.knocking_host {
                    debug!(first_byte = other, %host, "probe resistance: proxying to knocking host");
                    proxy_to_knocking_host(peeked, host).await;
                } else {
                    warn!(first_byte = other, "unrecognized protocol byte, closing");
                }
                Ok(())
            }
        }
    }
}

/// Transparently relays an undetected connection to the configured decoy
/// host, so a port scan sees what looks like an ordinary HTTP endpoint
/// rather than a connection reset.
async fn proxy_to_knocking_host(client: BoxedConn, host: &str) {
    let decoy = match tokio::net::TcpStream::connect(host).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%host, error = %e, "knocking host unreachable");
            return;
        }
    };
    let decoy: BoxedConn = Box::new(decoy);
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut decoy_rd, mut decoy_wr) = tokio::io::split(decoy);
    tokio::select! {
        _ = tokio::io::copy(&mut client_rd, &mut decoy_wr) => {}
        _ = tokio::io::copy(&mut decoy_rd, &mut client_wr) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticator::LocalAuthenticator;
    use crate::options::HandlerOptionsBuilder;
    use kvpn_core::Chain;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    fn test_options() -> HandlerOptions {
        HandlerOptionsBuilder::new()
            .address("127.0.0.1:0")
            .chain(Arc::new(Chain::new(vec![], 1, 3, Duration::from_secs(1))))
            .authenticator(Arc::new(LocalAuthenticator::empty()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_first_byte_closes_without_knocking_host() {
        let handler = AutoHandler::new(test_options());
        let (mut test_side, server_side): (tokio::io::DuplexStream, tokio::io::DuplexStream) =
            duplex(64);
        let boxed: BoxedConn = Box::new(server_side);

        let handle = tokio::spawn(async move { handler.handle(boxed).await });
        test_side.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(test_side);
        handle.await.unwrap().unwrap();
    }
}
