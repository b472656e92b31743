#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Token refresh failed or the upstream rejected the credentials.
    #[error("upstream auth failure: {0}")]
    Auth(String),
    /// Network error, timeout, or an unexpected upstream status.
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// Top-level response framing was malformed.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    pub fn from_status(status: http::StatusCode, body: &str) -> Self {
        let summary: String = body.chars().take(200).collect();
        if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
            UpstreamError::Auth(format!("status {status}: {summary}"))
        } else {
            UpstreamError::Transport(format!("status {status}: {summary}"))
        }
    }
}
