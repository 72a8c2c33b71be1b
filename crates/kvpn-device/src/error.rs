use thiserror::Error;

/// Errors from the virtual device subsystem. `Device` surfaces all of
/// these; none of them are retried internally — the caller (agent/session
/// layer) decides whether a failed reconfigure is fatal.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Interface creation failed; any partially constructed OS handle has
    /// already been released before this is returned.
    #[error("failed to open device: {0}")]
    Open(String),

    #[error("failed to read packet: {0}")]
    Read(String),

    #[error("failed to write packet: {0}")]
    Write(String),

    #[error("failed to configure device: {0}")]
    Configure(String),

    /// Operation recognized but not available on the current platform,
    /// e.g. `setMTU` post-creation on a driver that fixes it at open time.
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("device is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
