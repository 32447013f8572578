//! Error types for Nudge.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NudgeError>;

#[derive(Debug, Error)]
pub enum NudgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A uniqueness constraint rejected a write. Expected under concurrency.
    #[error("Constraint conflict: {0}")]
    Conflict(String),

    #[error("Message composition failed: {0}")]
    Compose(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport rate limited: {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl NudgeError {
    /// Failures the dispatcher retries with backoff, up to the job's attempt budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NudgeError::Compose(_)
                | NudgeError::Transport(_)
                | NudgeError::RateLimited(_)
                | NudgeError::Timeout(_)
                | NudgeError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(NudgeError::Compose("llm down".into()).is_retryable());
        assert!(NudgeError::Timeout("send".into()).is_retryable());
        assert!(NudgeError::RateLimited("429".into()).is_retryable());
        assert!(!NudgeError::Conflict("dup".into()).is_retryable());
        assert!(!NudgeError::Config("bad tz".into()).is_retryable());
    }
}
