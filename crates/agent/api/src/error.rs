use thiserror::Error;

/// Errors surfaced by an agent API client.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The request never produced a response (connection refused, reset,
    /// DNS failure, timeout).
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// The endpoint URL could not be used to build a client.
    #[error("invalid endpoint {endpoint}")]
    InvalidEndpoint { endpoint: String },
}

impl ApiError {
    /// Whether a call that failed with this error is worth repeating.
    ///
    /// Connection-level failures and server-side congestion are transient.
    /// A 4xx is the server rejecting the request outright; retrying it
    /// would only repeat the rejection.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::Server { status, .. } => *status >= 500 || *status == 429,
            ApiError::InvalidEndpoint { .. } => false,
        }
    }
}
