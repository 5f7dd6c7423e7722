use thiserror::Error;

/// Error kinds shared by every layer of the framework.
///
/// The variants map directly onto how a failure propagates:
///
/// - `Framing` is fatal for the connection that produced it
/// - `Codec` and `Service` are per-call and surfaced to the caller
/// - `Transport`/`Io` evict the pooled client and are retried per fail mode
/// - `Timeout` is surfaced and never retried
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// An error returned by the remote method, carried verbatim in the
    /// response header. Never evicts the pooled client.
    #[error("{0}")]
    Service(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("breaker open")]
    BreakerOpen,

    #[error("provider list is empty")]
    EmptyProviderList,

    #[error("client is shut down")]
    Shutdown,

    #[error("registration error: {0}")]
    Registration(String),

    #[error("watcher stopped")]
    WatcherStopped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// True when the error originated from a user method on the remote side.
    pub fn is_service(&self) -> bool {
        matches!(self, RpcError::Service(_))
    }

    /// True when the underlying connection should be discarded.
    pub fn evicts_connection(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::Io(_) | RpcError::Shutdown | RpcError::Framing(_)
        )
    }

    /// True when a fail mode is allowed to retry the call. Timeouts and
    /// remote service errors are final; so is an empty provider list.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::Io(_) | RpcError::Shutdown | RpcError::BreakerOpen
        )
    }

    /// True for io errors that mean the peer went away cleanly. The server
    /// logs these at debug level instead of treating them as failures.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            RpcError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<postcard::Error> for RpcError {
    fn from(err: postcard::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
