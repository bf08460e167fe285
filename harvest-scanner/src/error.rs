use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unexpected HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Gave up on {url} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Other error: {0}")]
    Other(String),
}

impl ScanError {
    /// Whether a fresh attempt at the same work may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ScanError::RetriesExhausted { .. } => true,
            ScanError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let exhausted = ScanError::RetriesExhausted {
            url: "http://a".into(),
            attempts: 3,
            last_error: "timeout".into(),
        };
        assert!(exhausted.is_retryable());
        assert!(
            ScanError::Status {
                url: "http://a".into(),
                status: 503
            }
            .is_retryable()
        );
        assert!(
            !ScanError::Status {
                url: "http://a".into(),
                status: 404
            }
            .is_retryable()
        );
        assert!(!ScanError::Cancelled.is_retryable());
        assert!(!ScanError::ParseError("bad".into()).is_retryable());
    }
}
