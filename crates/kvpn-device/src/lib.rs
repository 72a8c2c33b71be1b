//! kvpn-device: the virtual TUN interface the data plane reads/writes IP
//! packets through.
//!
//! Wraps the `tun` crate for the underlying fd, and adds the
//! configuration surface (subnets, DNS, MTU) and close-unblock semantics
//! a production caller needs beyond what the crate itself provides.

pub mod device;
pub mod error;

#[cfg(test)]
pub mod mock;

pub use device::{Device, DeviceState, TunDevice};
pub use error::{DeviceError, DeviceResult};
