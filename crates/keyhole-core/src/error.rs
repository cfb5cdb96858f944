use thiserror::Error;

/// Errors produced by the tunnel subsystem.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("admission denied: unknown or consumed token")]
    AdmissionDenied,

    #[error("tunnel limit reached")]
    TunnelsExhausted,

    #[error("no free port in the configured range")]
    NoFreePort,

    #[error("gateway bind failed: {0}")]
    BindFailed(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream rpc failure: {0}")]
    UpstreamRpcFailure(String),

    #[error("loopback failure: {0}")]
    LoopbackFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
