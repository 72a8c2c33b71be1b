//! RFC 1928 SOCKS5 server handler with RFC 1929 username/password
//! subnegotiation and a real bidirectional relay — unlike
//! `GatewayForwarder::tcp_relay`'s documented one-way-only relay, this
//! both reads from and writes back to the client, since a CONNECT proxy
//! that doesn't forward replies is not useful.

use crate::authenticator::Authenticator;
use crate::error::{HandlerError, HandlerResult};
use crate::options::HandlerOptions;
use kvpn_core::{BoxedConn, DialedConn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_OK: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Handles one accepted connection as a SOCKS5 session: method
/// negotiation, optional RFC 1929 auth, CONNECT, then relay.
pub struct Socks5Handler<'a> {
    options: &'a HandlerOptions,
}

impl<'a> Socks5Handler<'a> {
    pub fn new(options: &'a HandlerOptions) -> Self {
        Self { options }
    }

    pub async fn handle(&self, mut conn: BoxedConn) -> HandlerResult<()> {
        self.negotiate_method(&mut conn).await?;
        let target = self.read_connect_request(&mut conn).await?;

        let ct = CancellationToken::new();
        let timeout_fut = tokio::time::timeout(
            self.options.timeout,
            self.options.chain.dial(&ct, "tcp", &target),
        );
        let upstream = match timeout_fut.await {
            Ok(Ok(DialedConn::Stream(upstream))) => upstream,
            Ok(Ok(DialedConn::Datagram(_))) => {
                warn!(%target, "tcp dial unexpectedly produced a datagram endpoint");
                write_connect_reply(&mut conn, REPLY_GENERAL_FAILURE).await.ok();
                return Err(HandlerError::Dial(kvpn_core::CoreError::Other(
                    "tcp dial unexpectedly produced a datagram endpoint".into(),
                )));
            }
            Ok(Err(e)) => {
                warn!(%target, error = %e, "upstream dial failed");
                write_connect_reply(&mut conn, REPLY_HOST_UNREACHABLE).await.ok();
                return Err(HandlerError::Dial(e));
            }
            Err(_) => {
                write_connect_reply(&mut conn, REPLY_GENERAL_FAILURE).await.ok();
                return Err(HandlerError::Dial(kvpn_core::CoreError::Cancelled));
            }
        };

        write_connect_reply(&mut conn, REPLY_OK).await?;
        relay(conn, upstream).await;
        Ok(())
    }

    async fn negotiate_method(&self, conn: &mut BoxedConn) -> HandlerResult<()> {
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(HandlerError::Protocol);
        }
        let nmethods = head[1] as usize;
        let mut methods = vec![0u8; nmethods];
        conn.read_exact(&mut methods).await?;

        let requires_auth = self.options.authenticator.requires_auth();
        let chosen = if requires_auth && methods.contains(&METHOD_USERPASS) {
            METHOD_USERPASS
        } else if methods.contains(&METHOD_NO_AUTH) {
            METHOD_NO_AUTH
        } else if methods.contains(&METHOD_USERPASS) {
            METHOD_USERPASS
        } else {
            conn.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await.ok();
            return Err(HandlerError::Protocol);
        };

        conn.write_all(&[VERSION, chosen]).await?;

        if chosen == METHOD_USERPASS {
            self.authenticate(conn).await?;
        }
        Ok(())
    }

    /// RFC 1929 username/password subnegotiation. Exactly one rejection
    /// closes the connection.
    async fn authenticate(&self, conn: &mut BoxedConn) -> HandlerResult<()> {
        let mut ver = [0u8; 1];
        conn.read_exact(&mut ver).await?;
        if ver[0] != 0x01 {
            return Err(HandlerError::Protocol);
        }
        let user = read_length_prefixed(conn).await?;
        let pass = read_length_prefixed(conn).await?;

        let ok = self.options.authenticator.check(
            &String::from_utf8_lossy(&user),
            &String::from_utf8_lossy(&pass),
        );
        if ok {
            conn.write_all(&[0x01, 0x00]).await?;
            Ok(())
        } else {
            conn.write_all(&[0x01, 0x01]).await.ok();
            Err(HandlerError::Auth)
        }
    }

    async fn read_connect_request(&self, conn: &mut BoxedConn) -> HandlerResult<String> {
        let mut head = [0u8; 4];
        conn.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(HandlerError::Protocol);
        }
        if head[1] != CMD_CONNECT {
            write_connect_reply(conn, REPLY_COMMAND_NOT_SUPPORTED).await.ok();
            return Err(HandlerError::CommandNotSupported(head[1]));
        }

        let host = match head[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                conn.read_exact(&mut octets).await?;
                std::net::Ipv4Addr::from(octets).to_string()
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                conn.read_exact(&mut octets).await?;
                std::net::Ipv6Addr::from(octets).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                conn.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                conn.read_exact(&mut name).await?;
                String::from_utf8(name).map_err(|_| HandlerError::Protocol)?
            }
            other => {
                write_connect_reply(conn, REPLY_COMMAND_NOT_SUPPORTED).await.ok();
                return Err(HandlerError::CommandNotSupported(other));
            }
        };

        let mut port_bytes = [0u8; 2];
        conn.read_exact(&mut port_bytes).await?;
        let port = u16::from_be_bytes(port_bytes);
        debug!(target = %format!("{host}:{port}"), "socks5 connect request");
        Ok(format!("{host}:{port}"))
    }
}

async fn read_length_prefixed(conn: &mut BoxedConn) -> HandlerResult<Vec<u8>> {
    let mut len = [0u8; 1];
    conn.read_exact(&mut len).await?;
    let mut buf = vec![0u8; len[0] as usize];
    conn.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_connect_reply(conn: &mut BoxedConn, status: u8) -> HandlerResult<()> {
    // Bound address echoed back is always 0.0.0.0:0 — this data plane
    // does not track the real bound local address of the upstream dial.
    let reply = [VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    conn.write_all(&reply).await?;
    Ok(())
}

/// Bidirectional relay: two `tokio::io::copy` halves under a `select!`,
/// the same cancel-on-either-close shape `GatewayForwarder::tcp_relay`
/// uses, generalized to actually copy both directions.
async fn relay(client: BoxedConn, upstream: BoxedConn) {
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let client_to_upstream = tokio::io::copy(&mut client_rd, &mut upstream_wr);
    let upstream_to_client = tokio::io::copy(&mut upstream_rd, &mut client_wr);

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!(error = %e, "client->upstream relay ended");
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!(error = %e, "upstream->client relay ended");
            }
        }
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
    use tokio::io::duplex;

    fn test_options(authenticator: Arc<dyn crate::authenticator::Authenticator>) -> HandlerOptions {
        HandlerOptionsBuilder::new()
            .address("127.0.0.1:0")
            .chain(Arc::new(Chain::new(vec![], 1, 3, Duration::from_secs(1))))
            .authenticator(authenticator)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let options = test_options(Arc::new(LocalAuthenticator::empty()));
        let handler = Socks5Handler::new(&options);
        let (mut test_side, server_side): (tokio::io::DuplexStream, tokio::io::DuplexStream) =
            duplex(256);
        let mut boxed: BoxedConn = Box::new(server_side);

        let conn_fut = handler.negotiate_method(&mut boxed);
        test_side.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let result = conn_fut.await;
        assert!(matches!(result, Err(HandlerError::Protocol)));
    }

    #[tokio::test]
    async fn no_auth_negotiation_selects_no_auth_method() {
        let options = test_options(Arc::new(LocalAuthenticator::empty()));
        let handler = Socks5Handler::new(&options);
        let (mut test_side, server_side): (tokio::io::DuplexStream, tokio::io::DuplexStream) =
            duplex(256);

        let mut boxed: BoxedConn = Box::new(server_side);
        let negotiate = tokio::spawn(async move {
            let options = test_options(Arc::new(LocalAuthenticator::empty()));
            let handler = Socks5Handler::new(&options);
            handler.negotiate_method(&mut boxed).await
        });

        test_side.write_all(&[0x05, 0x01, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        test_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [VERSION, METHOD_NO_AUTH]);
        negotiate.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn userpass_auth_with_correct_credentials_succeeds() {
        let mut users = std::collections::HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        let authenticator = Arc::new(LocalAuthenticator::new(users));

        let (mut test_side, server_side): (tokio::io::DuplexStream, tokio::io::DuplexStream) =
            duplex(256);
        let mut boxed: BoxedConn = Box::new(server_side);

        let negotiate = tokio::spawn(async move {
            let options = test_options(authenticator);
            let handler = Socks5Handler::new(&options);
            handler.negotiate_method(&mut boxed).await
        });

        test_side
            .write_all(&[0x05, 0x01, METHOD_USERPASS])
            .await
            .unwrap();
        let mut method_reply = [0u8; 2];
        test_side.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [VERSION, METHOD_USERPASS]);

        let mut auth_req = vec![0x01, 5];
        auth_req.extend_from_slice(b"alice");
        auth_req.push(6);
        auth_req.extend_from_slice(b"secret");
        test_side.write_all(&auth_req).await.unwrap();

        let mut auth_reply = [0u8; 2];
        test_side.read_exact(&mut auth_reply).await.unwrap();
        assert_eq!(auth_reply, [0x01, 0x00]);
        negotiate.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn userpass_auth_with_wrong_credentials_fails_and_closes() {
        let mut users = std::collections::HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        let authenticator = Arc::new(LocalAuthenticator::new(users));

        let (mut test_side, server_side): (tokio::io::DuplexStream, tokio::io::DuplexStream) =
            duplex(256);
        let mut boxed: BoxedConn = Box::new(server_side);

        let negotiate = tokio::spawn(async move {
            let options = test_options(authenticator);
            let handler = Socks5Handler::new(&options);
            handler.negotiate_method(&mut boxed).await
        });

        test_side
            .write_all(&[0x05, 0x01, METHOD_USERPASS])
            .await
            .unwrap();
        let mut method_reply = [0u8; 2];
        test_side.read_exact(&mut method_reply).await.unwrap();

        let mut auth_req = vec![0x01, 5];
        auth_req.extend_from_slice(b"alice");
        auth_req.push(5);
        auth_req.extend_from_slice(b"wrong");
        test_side.write_all(&auth_req).await.unwrap();

        let mut auth_reply = [0u8; 2];
        test_side.read_exact(&mut auth_reply).await.unwrap();
        assert_eq!(auth_reply, [0x01, 0x01]);

        let result = negotiate.await.unwrap();
        assert!(matches!(result, Err(HandlerError::Auth)));
    }
}
