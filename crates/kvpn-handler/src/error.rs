use thiserror::Error;

/// Errors from protocol dispatch, the SOCKS5 handler, and option
/// validation. Malformed-input cases are logged and the connection closed
/// by the caller rather than propagated further up; this enum exists for
/// the cases a caller does need to distinguish (auth failure vs. a bad
/// option record vs. an upstream dial failure).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unsupported socks version or method")]
    Protocol,

    /// Authenticator rejected the supplied credentials.
    #[error("authentication failed")]
    Auth,

    #[error("socks command not supported: {0}")]
    CommandNotSupported(u8),

    #[error("invalid handler options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Dial(#[from] kvpn_core::CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HandlerResult<T> = Result<T, HandlerError>;
