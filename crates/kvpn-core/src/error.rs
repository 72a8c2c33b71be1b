use thiserror::Error;

/// Errors produced by the chain/node dialing subsystem.
///
/// Kinds follow the taxonomy a caller needs to tell apart, not the Rust type
/// that produced them — `Dial` covers every transport's connect failure.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Route selection found no usable node and the caller required one.
    #[error("empty chain: no route available")]
    EmptyChain,

    /// Underlying transport dial failed. Retryable within the chain's retry budget.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Proxy-protocol negotiation failed on a hop. Non-retryable for that
    /// hop on the current attempt; triggers a whole-dial retry.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A transport/feature is a recognized but unimplemented variant.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The dial was cancelled before completion.
    #[error("dial cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
