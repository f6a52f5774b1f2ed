use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The agent refused the submission (bad request, auth, quota policy).
    #[error("Submission rejected (status {status}): {message}")]
    SubmissionRejected { status: u16, message: String },

    /// The submission response did not carry a usable job id.
    #[error("Invalid job handle: {0}")]
    InvalidHandle(String),

    /// The agent reported a terminal failure for the job.
    #[error("Research job failed: {0}")]
    RemoteFailed(String),

    #[error("Research timed out after {elapsed_secs}s (budget {budget_secs}s)")]
    Timeout { elapsed_secs: u64, budget_secs: u64 },

    /// Network-level failure, distinct from a failure reported by the agent.
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl ClientError {
    /// Transport errors are the only class worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::TransportError(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::TransportError(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::TransportError(format!("malformed response: {err}"))
    }
}
