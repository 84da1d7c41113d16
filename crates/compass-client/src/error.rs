use thiserror::Error;

/// Errors raised on the client side of a chat stream.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Nothing to retry")]
    NothingToRetry,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Stream read failed: {0}")]
    Stream(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Request(_) | ClientError::Stream(_) => true,
            ClientError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
