use thiserror::Error;

/// Component-boundary error type.
///
/// Components that must never propagate a failure up to the scheduler (the
/// strategy executor, the staleness checker) catch this at their boundary and
/// fold it into a counted statistic instead of bubbling it further.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("forge request failed: {0}")]
    Forge(String),

    #[error("durable log error: {0}")]
    DurableLog(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        PipelineError::DurableLog(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Forge(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
