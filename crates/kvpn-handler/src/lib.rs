//! kvpn-handler: server-side dispatch of an accepted connection to a
//! protocol-specific handler — currently SOCKS5 (RFC 1928/1929) — plus
//! the local authenticator and the options record that configures both.

pub mod authenticator;
pub mod auto;
pub mod error;
pub mod options;
pub mod socks5;

pub use authenticator::{Authenticator, LocalAuthenticator};
pub use auto::AutoHandler;
pub use error::{HandlerError, HandlerResult};
pub use options::{HandlerOptions, HandlerOptionsBuilder};
