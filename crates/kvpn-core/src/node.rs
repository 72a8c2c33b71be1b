//! A single proxy hop and its health bookkeeping.

use crate::transport::{NodeClientDyn, TransportKind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One hop in a [`crate::Chain`]: where to dial, what protocol to speak
/// once connected, and a lock-free failure counter used for route
/// selection (skip nodes that are currently failing).
///
/// The failure counter and last-failure timestamp are atomics rather than
/// a mutex-guarded struct, the same tradeoff `GatewayPolicyEnforcer` makes
/// for its connection count: route selection runs on every dial and must
/// not contend with a lock held by a concurrent failure report.
pub struct Node {
    pub address: String,
    pub transport: TransportKind,
    pub client: Arc<dyn NodeClientDyn>,
    fail_count: AtomicU32,
    last_fail_millis: AtomicU64,
    epoch: Instant,
}

impl Node {
    pub fn new(
        address: impl Into<String>,
        transport: TransportKind,
        client: Arc<dyn NodeClientDyn>,
    ) -> Self {
        Self {
            address: address.into(),
            transport,
            client,
            fail_count: AtomicU32::new(0),
            last_fail_millis: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Record a dial/handshake failure against this node.
    pub fn record_failure(&self) {
        self.fail_count.fetch_add(1, Ordering::SeqCst);
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_fail_millis.store(elapsed, Ordering::SeqCst);
    }

    /// Current failure count.
    pub fn failure_count(&self) -> u32 {
        self.fail_count.load(Ordering::SeqCst)
    }

    /// If the node has failures but the most recent one is older than
    /// `fail_timeout`, clear the counter and report that it reset. Called
    /// once per dial attempt, before route selection consults
    /// `failure_count`, so a node that has recovered is eligible again
    /// without a background sweep.
    pub fn reset_if_stale(&self, fail_timeout: Duration) -> bool {
        if self.fail_count.load(Ordering::SeqCst) == 0 {
            return false;
        }
        let last = self.last_fail_millis.load(Ordering::SeqCst);
        let now = self.epoch.elapsed().as_millis() as u64;
        if now.saturating_sub(last) >= fail_timeout.as_millis() as u64 {
            self.fail_count.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.transport)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("transport", &self.transport)
            .field("fail_count", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UnimplementedClient;

    fn test_node() -> Node {
        Node::new(
            "127.0.0.1:1",
            TransportKind::Tcp,
            Arc::new(UnimplementedClient {
                kind: TransportKind::Tcp,
            }),
        )
    }

    #[test]
    fn fresh_node_has_no_failures() {
        let n = test_node();
        assert_eq!(n.failure_count(), 0);
        assert!(!n.reset_if_stale(Duration::from_secs(0)));
    }

    #[test]
    fn failure_count_increments() {
        let n = test_node();
        n.record_failure();
        n.record_failure();
        assert_eq!(n.failure_count(), 2);
    }

    #[test]
    fn stale_failure_resets_immediately_with_zero_timeout() {
        let n = test_node();
        n.record_failure();
        assert!(n.reset_if_stale(Duration::from_secs(0)));
        assert_eq!(n.failure_count(), 0);
    }

    #[test]
    fn recent_failure_does_not_reset_with_long_timeout() {
        let n = test_node();
        n.record_failure();
        assert!(!n.reset_if_stale(Duration::from_secs(3600)));
        assert_eq!(n.failure_count(), 1);
    }
}
