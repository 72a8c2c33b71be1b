//! Ordered proxy route, its pure route-selection step, and the dial/retry
//! loop that walks it.

use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::transport::{BoxedConn, DialedConn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An ordered list of hops a dial is tunneled through, plus the retry
/// budget for the whole dial. An empty chain means "dial the destination
/// directly" — not an error by itself; only the inability to *complete* a
/// dial is.
#[derive(Clone)]
pub struct Chain {
    nodes: Vec<Arc<Node>>,
    retries: usize,
    is_route: bool,
    max_fails: u32,
    fail_timeout: Duration,
}

impl Chain {
    /// `retries` is clamped to at least 1: a chain always gets one attempt.
    /// `max_fails` is clamped to at least 1: a node must be allowed to fail
    /// once before route selection can exclude it.
    pub fn new(nodes: Vec<Arc<Node>>, retries: usize, max_fails: u32, fail_timeout: Duration) -> Self {
        Self {
            nodes,
            retries: retries.max(1),
            is_route: false,
            max_fails: max_fails.max(1),
            fail_timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Clears any failure counter whose last failure is older than
    /// `fail_timeout`, letting a recovered node back into route selection.
    /// Not called from `select_route` itself — that function must stay
    /// pure, so callers run this once per dial attempt before selecting.
    fn refresh_health(&self) {
        for node in &self.nodes {
            node.reset_if_stale(self.fail_timeout);
        }
    }

    /// Pure route selection: no I/O, no mutation of any node. Prefers
    /// nodes with fewer than `max_fails` recorded failures; if every node
    /// in the chain has hit the threshold, falls back to the full chain
    /// rather than reporting no route (a transient all-down state should
    /// still attempt a dial).
    pub fn select_route(&self) -> Chain {
        let healthy: Vec<Arc<Node>> = self
            .nodes
            .iter()
            .filter(|n| n.failure_count() < self.max_fails)
            .cloned()
            .collect();
        let chosen = if healthy.is_empty() {
            debug!(chain_len = self.nodes.len(), "all hops failing, using full chain");
            self.nodes.clone()
        } else {
            healthy
        };
        let route_len = chosen.len();
        if route_len > 0 {
            tracing::info!(
                route_len,
                first_hop = %chosen[0],
                "route selected"
            );
        }
        Chain {
            nodes: chosen,
            retries: self.retries,
            is_route: true,
            max_fails: self.max_fails,
            fail_timeout: self.fail_timeout,
        }
    }

    /// Dial `address` over `network` ("tcp" or "udp"), tunneling through
    /// the chain's hops in order and retrying up to `retries` times.
    /// Cancelling `ct` aborts the in-flight attempt and any further retry.
    pub async fn dial(
        &self,
        ct: &CancellationToken,
        network: &str,
        address: &str,
    ) -> CoreResult<DialedConn> {
        if self.nodes.is_empty() {
            return direct_dial(ct, network, address).await;
        }

        let mut last_err = CoreError::EmptyChain;
        for attempt in 0..self.retries {
            if ct.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            self.refresh_health();
            let route = self.select_route();
            let attempt_fut = route.dial_once(network, address);
            let outcome = tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(CoreError::Cancelled),
                result = attempt_fut => result,
            };
            match outcome {
                Ok(conn) => return Ok(DialedConn::Stream(conn)),
                Err(e) => {
                    warn!(attempt, error = %e, "chain dial attempt failed");
                    for node in &route.nodes {
                        node.record_failure();
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// A handshaken connection to the chain's terminal node, with no
    /// further destination dialed past it — unlike `dial`, which also
    /// proxies to a caller-supplied target through that terminal node.
    /// Meant for callers that treat the last hop itself as the
    /// destination (e.g. tunneling raw packets to a gateway node). Uses
    /// the same retry envelope as `dial`; an empty chain has no terminal
    /// node to reach, so it errors rather than falling back to a direct
    /// dial.
    pub async fn conn(&self, ct: &CancellationToken) -> CoreResult<BoxedConn> {
        if self.nodes.is_empty() {
            return Err(CoreError::EmptyChain);
        }

        let mut last_err = CoreError::EmptyChain;
        for attempt in 0..self.retries {
            if ct.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            self.refresh_health();
            let route = self.select_route();
            let attempt_fut = route.conn_once();
            let outcome = tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(CoreError::Cancelled),
                result = attempt_fut => result,
            };
            match outcome {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(attempt, error = %e, "chain conn attempt failed");
                    for node in &route.nodes {
                        node.record_failure();
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Walks the hop chain from the first node to the terminal node only —
    /// no trailing `Connect` to a further destination, unlike `dial_once`.
    async fn conn_once(&self) -> CoreResult<BoxedConn> {
        let first = self.nodes.first().ok_or(CoreError::EmptyChain)?;
        debug!(hop = %first.address, "dialing first hop");
        let mut conn = first.client.dial(&first.address).await?;

        for window in self.nodes.windows(2) {
            let (current, next) = (&window[0], &window[1]);
            conn = current.client.connect(conn, "tcp", &next.address).await?;
        }
        Ok(conn)
    }

    async fn dial_once(&self, network: &str, address: &str) -> CoreResult<BoxedConn> {
        if network != "tcp" {
            return Err(CoreError::Unsupported(
                "proxied dial only tunnels tcp destinations".into(),
            ));
        }
        let conn = self.conn_once().await?;
        let last = self.nodes.last().expect("checked non-empty above");
        let resolved = resolve_address(address).await?;
        last.client.connect(conn, "tcp", &resolved).await
    }
}

/// Direct (chain-less) dial. TCP requires a concrete destination; UDP with
/// no address binds an ephemeral listening socket instead of erroring,
/// since "receive whatever arrives" is a legitimate UDP use (e.g. the
/// virtual device's datagram path binding before it knows its peer).
async fn direct_dial(
    ct: &CancellationToken,
    network: &str,
    address: &str,
) -> CoreResult<DialedConn> {
    match network {
        "tcp" => {
            if address.is_empty() {
                return Err(CoreError::Dial(
                    "direct tcp dial requires a destination address".into(),
                ));
            }
            let resolved = resolve_address(address).await?;
            let connect_fut = TcpStream::connect(&resolved);
            let stream = tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(CoreError::Cancelled),
                result = connect_fut => result.map_err(|e| CoreError::Dial(format!("{resolved}: {e}")))?,
            };
            Ok(DialedConn::Stream(Box::new(stream)))
        }
        "udp" => {
            let bind_addr = if address.is_empty() { "0.0.0.0:0" } else { address };
            let socket = UdpSocket::bind(bind_addr)
                .await
                .map_err(|e| CoreError::Dial(format!("udp bind {bind_addr}: {e}")))?;
            if !address.is_empty() {
                let resolved = resolve_address(address).await?;
                if let Ok(peer) = resolved.parse::<SocketAddr>() {
                    socket
                        .connect(peer)
                        .await
                        .map_err(|e| CoreError::Dial(format!("udp connect {peer}: {e}")))?;
                }
            }
            Ok(DialedConn::Datagram(socket))
        }
        other => Err(CoreError::Unsupported(format!("network {other}"))),
    }
}

/// Resolve `host:port` to a `SocketAddr` string via the system resolver,
/// falling back to the literal input if it already parses as an address
/// or if resolution fails outright (the caller's dial attempt will then
/// surface the real connect error rather than a DNS error masking it).
async fn resolve_address(address: &str) -> CoreResult<String> {
    if address.parse::<SocketAddr>().is_ok() {
        return Ok(address.to_string());
    }
    match tokio::net::lookup_host(address).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => Ok(addr.to_string()),
            None => Ok(address.to_string()),
        },
        Err(_) => Ok(address.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportKind, UnimplementedClient};

    fn unsupported_node(addr: &str) -> Arc<Node> {
        Arc::new(Node::new(
            addr,
            TransportKind::Tcp,
            Arc::new(UnimplementedClient {
                kind: TransportKind::Tcp,
            }),
        ))
    }

    #[test]
    fn retries_clamped_to_at_least_one() {
        let chain = Chain::new(vec![], 0, 3, Duration::from_secs(1));
        assert_eq!(chain.retries, 1);
    }

    #[test]
    fn select_route_is_pure_and_prefers_healthy_nodes() {
        let healthy = unsupported_node("127.0.0.1:1");
        let failing = unsupported_node("127.0.0.1:2");
        failing.record_failure();
        let chain = Chain::new(vec![healthy.clone(), failing.clone()], 3, 1, Duration::from_secs(60));

        let route = chain.select_route();
        assert_eq!(route.nodes().len(), 1);
        assert_eq!(route.nodes()[0].address, healthy.address);
        // Original chain is untouched by selection.
        assert_eq!(chain.nodes().len(), 2);
    }

    #[test]
    fn select_route_falls_back_to_full_chain_when_all_failing() {
        let a = unsupported_node("127.0.0.1:1");
        let b = unsupported_node("127.0.0.1:2");
        a.record_failure();
        b.record_failure();
        let chain = Chain::new(vec![a, b], 1, 1, Duration::from_secs(3600));

        let route = chain.select_route();
        assert_eq!(route.nodes().len(), 2);
    }

    #[tokio::test]
    async fn empty_chain_tcp_direct_dial_requires_address() {
        let chain = Chain::new(vec![], 1, 3, Duration::from_secs(1));
        let ct = CancellationToken::new();
        let err = chain.dial(&ct, "tcp", "").await.unwrap_err();
        assert!(matches!(err, CoreError::Dial(_)));
    }

    #[tokio::test]
    async fn empty_chain_udp_with_no_address_binds_a_listener() {
        let chain = Chain::new(vec![], 1, 3, Duration::from_secs(1));
        let ct = CancellationToken::new();
        let dialed = chain.dial(&ct, "udp", "").await.unwrap();
        match dialed {
            DialedConn::Datagram(socket) => {
                assert!(socket.local_addr().is_ok());
            }
            DialedConn::Stream(_) => panic!("expected a datagram endpoint"),
        }
    }

    #[tokio::test]
    async fn empty_chain_with_failing_nodes_still_attempts_direct_dial() {
        // Sanity: an actually-empty node list, not a chain of failing nodes,
        // is what triggers direct dial.
        let chain = Chain::new(vec![], 1, 3, Duration::from_secs(1));
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_dial() {
        let a = unsupported_node("127.0.0.1:1");
        let chain = Chain::new(vec![a], 3, 3, Duration::from_secs(1));
        let ct = CancellationToken::new();
        ct.cancel();
        let err = chain.dial(&ct, "tcp", "example.invalid:80").await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn dial_through_unimplemented_transport_surfaces_unsupported_after_retries() {
        let a = unsupported_node("127.0.0.1:1");
        let chain = Chain::new(vec![a], 2, 3, Duration::from_secs(1));
        let ct = CancellationToken::new();
        let err = chain.dial(&ct, "tcp", "example.invalid:80").await.unwrap_err();
        assert!(matches!(err, CoreError::Unsupported(_)));
    }
}
