use chatgate_scheduler::{RetryError, SchedulerError};
use chatgate_storage::StorageError;
use chatgate_upstream::UpstreamError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("daily quota exhausted")]
    RateLimit,
    #[error("no available provider")]
    NoAvailableProvider,
    #[error("upstream auth failure: {0}")]
    UpstreamAuth(String),
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Auth(_) => 401,
            GatewayError::RateLimit => 429,
            GatewayError::NoAvailableProvider => 503,
            GatewayError::UpstreamAuth(_)
            | GatewayError::UpstreamTransport(_)
            | GatewayError::UpstreamProtocol(_) => 502,
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Upstream-side failures are worth retrying on another provider.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamAuth(_)
                | GatewayError::UpstreamTransport(_)
                | GatewayError::UpstreamProtocol(_)
        )
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Auth(message) => GatewayError::UpstreamAuth(message),
            UpstreamError::Transport(message) => GatewayError::UpstreamTransport(message),
            UpstreamError::Protocol(message) => GatewayError::UpstreamProtocol(message),
        }
    }
}

impl From<SchedulerError> for GatewayError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NoAvailableProvider => GatewayError::NoAvailableProvider,
            SchedulerError::Storage(err) => GatewayError::Internal(err.to_string()),
        }
    }
}

impl From<RetryError<GatewayError>> for GatewayError {
    fn from(err: RetryError<GatewayError>) -> Self {
        match err {
            RetryError::NoAvailableProvider => GatewayError::NoAvailableProvider,
            RetryError::Storage(err) => GatewayError::Internal(err.to_string()),
            RetryError::Op(err) => err,
        }
    }
}
