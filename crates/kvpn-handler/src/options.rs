//! `HandlerOptions`: the record an `AutoHandler` is constructed with, and
//! its validating builder — a single record plus one builder with
//! validation in one place, rather than a transformer function per field.

use crate::authenticator::{Authenticator, LocalAuthenticator};
use crate::error::{HandlerError, HandlerResult};
use kvpn_core::Chain;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fully resolved handler configuration. `Arc`-wrapped fields are shared
/// across the connections an `AutoHandler` dispatches to.
#[derive(Clone)]
pub struct HandlerOptions {
    pub address: String,
    pub chain: Arc<Chain>,
    pub authenticator: Arc<dyn Authenticator>,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    pub max_fails: u32,
    pub fail_timeout: Duration,
    pub retries: usize,
    pub timeout: Duration,
    pub knocking_host: Option<String>,
    pub node_identity: Option<String>,
    pub target_host: Option<String>,
    pub ip_list: Vec<String>,
    pub tcp_mode: bool,
    pub ip_routes: Vec<String>,
}

/// Builds a [`HandlerOptions`]. Setters are commutative — last write per
/// field wins regardless of call order — with one deliberate exception:
/// `users` only has an effect on the final authenticator if `authenticator`
/// was never called explicitly; that derivation itself is idempotent
/// (calling `users` twice with the same map, in any position relative to
/// other setters, produces the same derived authenticator).
#[derive(Default)]
pub struct HandlerOptionsBuilder {
    address: Option<String>,
    chain: Option<Arc<Chain>>,
    users: Option<HashMap<String, String>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    max_fails: Option<u32>,
    fail_timeout: Option<Duration>,
    retries: Option<usize>,
    timeout: Option<Duration>,
    knocking_host: Option<String>,
    node_identity: Option<String>,
    target_host: Option<String>,
    ip_list: Option<Vec<String>>,
    tcp_mode: Option<bool>,
    ip_routes: Option<Vec<String>>,
}

impl HandlerOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn chain(mut self, chain: Arc<Chain>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Derivation side-effect: builds a `LocalAuthenticator` keyed by
    /// username -> password, used unless `authenticator` overrides it.
    pub fn users(mut self, users: HashMap<String, String>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn tls_config(mut self, tls_config: Arc<rustls::ServerConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    pub fn max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = Some(max_fails);
        self
    }

    pub fn fail_timeout(mut self, fail_timeout: Duration) -> Self {
        self.fail_timeout = Some(fail_timeout);
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Probe-resistance decoy host: unexpected first bytes are proxied
    /// here instead of closed outright.
    pub fn knocking_host(mut self, host: impl Into<String>) -> Self {
        self.knocking_host = Some(host.into());
        self
    }

    pub fn node_identity(mut self, identity: impl Into<String>) -> Self {
        self.node_identity = Some(identity.into());
        self
    }

    pub fn target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = Some(host.into());
        self
    }

    pub fn ip_list(mut self, ip_list: Vec<String>) -> Self {
        self.ip_list = Some(ip_list);
        self
    }

    pub fn tcp_mode(mut self, tcp_mode: bool) -> Self {
        self.tcp_mode = Some(tcp_mode);
        self
    }

    pub fn ip_routes(mut self, ip_routes: Vec<String>) -> Self {
        self.ip_routes = Some(ip_routes);
        self
    }

    /// Validates and resolves the record. `address` and `chain` are
    /// required; everything else has a documented default.
    pub fn build(self) -> HandlerResult<HandlerOptions> {
        let address = self
            .address
            .filter(|a| !a.is_empty())
            .ok_or_else(|| HandlerError::InvalidOptions("address is required".into()))?;
        let chain = self
            .chain
            .ok_or_else(|| HandlerError::InvalidOptions("chain is required".into()))?;

        let authenticator: Arc<dyn Authenticator> = match self.authenticator {
            Some(a) => a,
            None => Arc::new(LocalAuthenticator::new(self.users.unwrap_or_default())),
        };

        Ok(HandlerOptions {
            address,
            chain,
            authenticator,
            tls_config: self.tls_config,
            max_fails: self.max_fails.unwrap_or(3),
            fail_timeout: self.fail_timeout.unwrap_or(Duration::from_secs(30)),
            retries: self.retries.unwrap_or(1).max(1),
            timeout: self.timeout.unwrap_or(Duration::from_secs(10)),
            knocking_host: self.knocking_host,
            node_identity: self.node_identity,
            target_host: self.target_host,
            ip_list: self.ip_list.unwrap_or_default(),
            tcp_mode: self.tcp_mode.unwrap_or(false),
            ip_routes: self.ip_routes.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn empty_chain() -> Arc<Chain> {
        Arc::new(Chain::new(vec![], 1, 3, Duration::from_secs(30)))
    }

    #[test]
    fn missing_address_fails_validation() {
        let err = HandlerOptionsBuilder::new()
            .chain(empty_chain())
            .build()
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidOptions(_)));
    }

    #[test]
    fn setter_order_does_not_affect_the_resolved_record() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());

        let a = HandlerOptionsBuilder::new()
            .address("0.0.0.0:1080")
            .chain(empty_chain())
            .users(users.clone())
            .max_fails(5)
            .build()
            .unwrap();

        let b = HandlerOptionsBuilder::new()
            .max_fails(5)
            .users(users)
            .address("0.0.0.0:1080")
            .chain(empty_chain())
            .build()
            .unwrap();

        assert_eq!(a.address, b.address);
        assert_eq!(a.max_fails, b.max_fails);
        assert!(a.authenticator.check("alice", "secret"));
        assert!(b.authenticator.check("alice", "secret"));
        assert!(!a.authenticator.check("alice", "wrong"));
        assert!(!b.authenticator.check("alice", "wrong"));
    }

    #[test]
    fn users_derivation_is_idempotent() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());

        let opts = HandlerOptionsBuilder::new()
            .address("0.0.0.0:1080")
            .chain(empty_chain())
            .users(users.clone())
            .users(users)
            .build()
            .unwrap();

        assert!(opts.authenticator.check("alice", "secret"));
    }

    #[test]
    fn explicit_authenticator_overrides_users() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());

        let opts = HandlerOptionsBuilder::new()
            .address("0.0.0.0:1080")
            .chain(empty_chain())
            .users(users)
            .authenticator(Arc::new(LocalAuthenticator::empty()))
            .build()
            .unwrap();

        // LocalAuthenticator::empty() permits everyone, overriding the
        // users-derived one that would have rejected "mallory".
        assert!(opts.authenticator.check("mallory", "anything"));
    }
}
