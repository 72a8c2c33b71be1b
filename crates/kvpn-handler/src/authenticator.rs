//! The `Check(user, pass) -> bool` capability and its built-in local
//! implementation.

use std::collections::HashMap;

/// Username/password verification used by the SOCKS5 handler's RFC 1929
/// subnegotiation.
pub trait Authenticator: Send + Sync {
    fn check(&self, user: &str, pass: &str) -> bool;

    /// Whether method negotiation should prefer username/password over
    /// no-auth when the client offers both. An authenticator with no
    /// credentials configured has nothing to check, so no-auth is fine.
    fn requires_auth(&self) -> bool {
        true
    }
}

/// Maps user to password exactly. If constructed with no users at all,
/// every credential check passes — a deliberate default for the
/// trusted-network case. Anyone wiring this crate up for a non-trusted
/// network must configure at least one user.
pub struct LocalAuthenticator {
    users: HashMap<String, String>,
}

impl LocalAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn empty() -> Self {
        Self {
            users: HashMap::new(),
        }
    }
}

impl Authenticator for LocalAuthenticator {
    fn check(&self, user: &str, pass: &str) -> bool {
        if self.users.is_empty() {
            return true;
        }
        match self.users.get(user) {
            Some(expected) => expected == pass,
            None => false,
        }
    }

    fn requires_auth(&self) -> bool {
        !self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(pairs: &[(&str, &str)]) -> LocalAuthenticator {
        LocalAuthenticator::new(
            pairs
                .iter()
                .map(|(u, p)| (u.to_string(), p.to_string()))
                .collect(),
        )
    }

    #[test]
    fn no_users_configured_permits_everything() {
        let auth = LocalAuthenticator::empty();
        assert!(auth.check("anyone", "anything"));
        assert!(!auth.requires_auth());
    }

    #[test]
    fn correct_credentials_succeed() {
        let auth = users(&[("alice", "secret"), ("bob", "hunter2")]);
        assert!(auth.check("alice", "secret"));
        assert!(auth.check("bob", "hunter2"));
    }

    #[test]
    fn wrong_password_fails() {
        let auth = users(&[("alice", "secret")]);
        assert!(!auth.check("alice", "wrong"));
    }

    #[test]
    fn missing_user_fails() {
        let auth = users(&[("alice", "secret")]);
        assert!(!auth.check("carol", "secret"));
    }
}
