//! kvpn-core: the proxy-chain dialer and hop/node model for the kvpn data plane.
//!
//! Provides the [`Node`] hop descriptor, the [`Chain`] dial primitive that
//! tunnels a destination through zero or more proxy hops with retries, and
//! the transport-capability model ([`transport::NodeClient`],
//! [`transport::TransportKind`]) each hop dials through.

pub mod chain;
pub mod error;
pub mod node;
pub mod transport;
pub mod ws_bridge;

pub use chain::Chain;
pub use error::{CoreError, CoreResult};
pub use node::Node;
pub use transport::{
    default_client, BoxedConn, Connection, DialedConn, NodeClient, NodeClientDyn, TransportKind,
};
