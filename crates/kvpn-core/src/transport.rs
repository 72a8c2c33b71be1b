//! Hop transport abstraction.
//!
//! A small closed set of transport kinds, each with a concrete client,
//! rather than pervasive `dyn` dispatch. The one seam that does need
//! dynamic dispatch — a `Node` holding "whichever client its transport
//! kind implies" — goes through [`NodeClientDyn`], a boxed-future adapter
//! over the plain (non-object-safe, `async fn`-in-trait) [`NodeClient`].

use crate::error::{CoreError, CoreResult};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// A hop connection: anything that reads and writes bytes.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// A boxed, type-erased [`Connection`].
pub type BoxedConn = Box<dyn Connection>;

/// Result of a `Chain::dial`. Most dials produce a byte stream; an empty
/// chain dialing a datagram network with no address produces a bound,
/// listening datagram endpoint instead.
pub enum DialedConn {
    Stream(BoxedConn),
    Datagram(UdpSocket),
}

/// The closed set of transports a [`crate::Node`] may speak to its hop.
///
/// Per the design notes, this is a tagged enum rather than open-ended
/// polymorphism: new transports are added here, not via a new `impl
/// NodeClient for AnythingElse` scattered across call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Ws,
    Kcp,
    Quic,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Ws => "ws",
            TransportKind::Kcp => "kcp",
            TransportKind::Quic => "quic",
        };
        f.write_str(s)
    }
}

/// The two protocol-level operations a hop exposes to [`crate::Chain`].
///
/// Neither is individually deadline-bound; `Chain` callers wrap the whole
/// dial/conn operation (every hop it walks) in a single
/// `tokio::time::timeout`, the way `Socks5Handler::handle` does around
/// `chain.dial`. A per-hop deadline inside each client would just be a
/// second, redundant clock racing the caller's.
#[allow(async_fn_in_trait)]
pub trait NodeClient: Send + Sync {
    /// Open the transport to this hop.
    async fn dial(&self, address: &str) -> CoreResult<BoxedConn>;

    /// Perform the hop's proxy handshake so reads/writes on the returned
    /// connection are proxied to `target_address`.
    async fn connect(
        &self,
        raw: BoxedConn,
        network: &str,
        target_address: &str,
    ) -> CoreResult<BoxedConn>;
}

/// Plain TCP hop client: `dial` opens a TCP connection, `connect` issues a
/// SOCKS5 CONNECT handshake over it (the only proxy protocol this data
/// plane speaks as a client).
pub struct TcpClient;

impl TcpClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(async_fn_in_trait)]
impl NodeClient for TcpClient {
    async fn dial(&self, address: &str) -> CoreResult<BoxedConn> {
        debug!(address, "dialing tcp hop");
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| CoreError::Dial(format!("tcp connect {address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CoreError::Dial(format!("set_nodelay: {e}")))?;
        Ok(Box::new(stream))
    }

    async fn connect(
        &self,
        raw: BoxedConn,
        network: &str,
        target_address: &str,
    ) -> CoreResult<BoxedConn> {
        socks5_client_handshake(raw, network, target_address).await
    }
}

/// TLS hop client. The `rustls::ClientConfig` is built and seeded by an
/// external key-exchange layer; this crate only consumes it.
pub struct TlsClient {
    config: Arc<rustls::ClientConfig>,
    server_name: String,
}

impl TlsClient {
    pub fn new(config: Arc<rustls::ClientConfig>, server_name: impl Into<String>) -> Self {
        Self {
            config,
            server_name: server_name.into(),
        }
    }
}

#[allow(async_fn_in_trait)]
impl NodeClient for TlsClient {
    async fn dial(&self, address: &str) -> CoreResult<BoxedConn> {
        debug!(address, server_name = %self.server_name, "dialing tls hop");
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| CoreError::Dial(format!("tcp connect {address}: {e}")))?;
        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        let server_name = rustls::pki_types::ServerName::try_from(self.server_name.clone())
            .map_err(|e| CoreError::Dial(format!("invalid server name: {e}")))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| CoreError::Dial(format!("tls handshake {address}: {e}")))?;
        Ok(Box::new(tls))
    }

    async fn connect(
        &self,
        raw: BoxedConn,
        network: &str,
        target_address: &str,
    ) -> CoreResult<BoxedConn> {
        socks5_client_handshake(raw, network, target_address).await
    }
}

/// WebSocket hop client — tunnels the proxy handshake and subsequent bytes
/// inside binary WS frames, carried over a WebSocket upgrade.
pub struct WsClient;

impl WsClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(async_fn_in_trait)]
impl NodeClient for WsClient {
    async fn dial(&self, address: &str) -> CoreResult<BoxedConn> {
        let url = format!("ws://{address}/");
        debug!(%url, "dialing ws hop");
        let (ws_stream, _resp) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| CoreError::Dial(format!("ws connect {address}: {e}")))?;
        Ok(Box::new(crate::ws_bridge::WsByteStream::new(ws_stream)))
    }

    async fn connect(
        &self,
        raw: BoxedConn,
        network: &str,
        target_address: &str,
    ) -> CoreResult<BoxedConn> {
        socks5_client_handshake(raw, network, target_address).await
    }
}

/// KCP and QUIC are recognized `TransportKind` variants (closed set, per the
/// design notes) without a wired-up hop implementation in this build — see
/// `DESIGN.md`. Dialing either returns `Unsupported` rather than silently
/// falling back to TCP.
pub struct UnimplementedClient {
    pub kind: TransportKind,
}

#[allow(async_fn_in_trait)]
impl NodeClient for UnimplementedClient {
    async fn dial(&self, _address: &str) -> CoreResult<BoxedConn> {
        Err(CoreError::Unsupported(format!(
            "{} hop transport is not wired in this build",
            self.kind
        )))
    }

    async fn connect(
        &self,
        _raw: BoxedConn,
        _network: &str,
        _target_address: &str,
    ) -> CoreResult<BoxedConn> {
        Err(CoreError::Unsupported(format!(
            "{} hop transport is not wired in this build",
            self.kind
        )))
    }
}

/// Build the default `NodeClient` for a given transport kind with no extra
/// configuration (TLS needs a `ClientConfig` + server name — construct a
/// `TlsClient` directly for that case instead of going through here).
pub fn default_client(kind: TransportKind) -> Arc<dyn NodeClientDyn> {
    match kind {
        TransportKind::Tcp => Arc::new(DynClient(TcpClient::new())),
        TransportKind::Ws => Arc::new(DynClient(WsClient::new())),
        other => Arc::new(DynClient(UnimplementedClient { kind: other })),
    }
}

/// `NodeClient` is not object-safe as written (it's `async fn`-in-trait);
/// `NodeClientDyn` is the boxed-future adapter used only where a `Node`
/// needs to hold "whichever client" behind an `Arc<dyn _>`.
#[allow(async_fn_in_trait)]
pub trait NodeClientDyn: Send + Sync {
    fn dial<'a>(
        &'a self,
        address: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<BoxedConn>> + Send + 'a>>;

    fn connect<'a>(
        &'a self,
        raw: BoxedConn,
        network: &'a str,
        target_address: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<BoxedConn>> + Send + 'a>>;
}

struct DynClient<C>(C);

impl<C: NodeClient + 'static> NodeClientDyn for DynClient<C> {
    fn dial<'a>(
        &'a self,
        address: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<BoxedConn>> + Send + 'a>>
    {
        Box::pin(self.0.dial(address))
    }

    fn connect<'a>(
        &'a self,
        raw: BoxedConn,
        network: &'a str,
        target_address: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<BoxedConn>> + Send + 'a>>
    {
        Box::pin(self.0.connect(raw, network, target_address))
    }
}

/// Minimal SOCKS5 client-side CONNECT handshake (RFC 1928), no-auth only —
/// this is what `Chain` speaks to reach the *next* hop when that hop is a
/// SOCKS5 proxy. (The server-side handler living in `kvpn-handler` speaks
/// the same RFC from the other end, including RFC 1929 auth.)
async fn socks5_client_handshake(
    mut raw: BoxedConn,
    network: &str,
    target_address: &str,
) -> CoreResult<BoxedConn> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    if network != "tcp" {
        return Err(CoreError::Handshake(format!(
            "socks5 hops only carry tcp, not {network}"
        )));
    }

    // Greeting: version 5, one method, no-auth.
    raw.write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(|e| CoreError::Handshake(format!("socks5 greeting: {e}")))?;
    let mut method_reply = [0u8; 2];
    raw.read_exact(&mut method_reply)
        .await
        .map_err(|e| CoreError::Handshake(format!("socks5 method reply: {e}")))?;
    if method_reply[0] != 0x05 || method_reply[1] != 0x00 {
        return Err(CoreError::Handshake(
            "socks5 hop requires authentication this client cannot provide".into(),
        ));
    }

    let (host, port) = split_host_port(target_address)?;
    let mut request = vec![0x05, 0x01, 0x00];
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        request.push(0x01);
        request.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
        request.push(0x04);
        request.extend_from_slice(&ip.octets());
    } else {
        request.push(0x03);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());

    raw.write_all(&request)
        .await
        .map_err(|e| CoreError::Handshake(format!("socks5 request: {e}")))?;

    let mut reply_head = [0u8; 4];
    raw.read_exact(&mut reply_head)
        .await
        .map_err(|e| CoreError::Handshake(format!("socks5 reply: {e}")))?;
    if reply_head[1] != 0x00 {
        return Err(CoreError::Handshake(format!(
            "socks5 CONNECT rejected with status 0x{:02x}",
            reply_head[1]
        )));
    }
    // Consume the bound address the server echoes back.
    match reply_head[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            raw.read_exact(&mut rest).await.ok();
        }
        0x04 => {
            let mut rest = [0u8; 18];
            raw.read_exact(&mut rest).await.ok();
        }
        0x03 => {
            let mut len = [0u8; 1];
            if raw.read_exact(&mut len).await.is_ok() {
                let mut rest = vec![0u8; len[0] as usize + 2];
                raw.read_exact(&mut rest).await.ok();
            }
        }
        _ => {}
    }

    Ok(raw)
}

fn split_host_port(address: &str) -> CoreResult<(String, u16)> {
    let (host, port_str) = address
        .rsplit_once(':')
        .ok_or_else(|| CoreError::Handshake(format!("invalid address {address}")))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| CoreError::Handshake(format!("invalid port in {address}")))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
}
