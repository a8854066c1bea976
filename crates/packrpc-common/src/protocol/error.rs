use thiserror::Error;

/// Error type covering the packrpc contract surface.
///
/// Protocol-level errors (`BadName`, `Overflow`, `Unauthorized`) close the
/// owning session. `IncompleteData` is recovered locally by the frame
/// decoder and only surfaces to direct codec callers. Dispatch-level errors
/// (`MethodUndefined`, `ParamUndefined`) drop the offending frame and leave
/// the session open.
#[derive(Error, Debug)]
pub enum PackrpcError {
    #[error("incomplete frame data")]
    IncompleteData,

    #[error("method or argument type name exceeds the wire limit")]
    BadName,

    #[error("declared frame length overflows the receive buffer")]
    Overflow,

    #[error("rpc method undefined: {0}")]
    MethodUndefined(String),

    #[error("rpc argument type undefined: {0}")]
    ParamUndefined(String),

    #[error("connection unauthorized: bad handshake byte")]
    Unauthorized,

    #[error("connection table is full")]
    ConnectionFull,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no pooled connection available")]
    NoAvailable,

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("a call is already awaiting a reply on this session")]
    CallInProgress,

    #[error("invalid service registration: {0}")]
    BadReceiver(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(String),
}

impl PackrpcError {
    /// Whether the operation that produced this error is worth retrying.
    ///
    /// Pool exhaustion, timeouts, and transport-level failures are
    /// transient; everything else is a permanent condition the caller must
    /// fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PackrpcError::NoAvailable
                | PackrpcError::Timeout(_)
                | PackrpcError::Connection(_)
                | PackrpcError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PackrpcError>;
