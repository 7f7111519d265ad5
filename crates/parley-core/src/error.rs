use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Daily token quota exceeded")]
    QuotaExceeded,

    /// Control-flow suspension: a tool call waits for a human decision.
    #[error("Awaiting confirmation for tool call {tool_call_id}")]
    AwaitingConfirmation { tool_call_id: String },

    #[error("Generation stopped by user")]
    GenerationStopped,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Stable wire code used in transport error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::QuotaExceeded => "quota_exceeded",
            Self::AwaitingConfirmation { .. } => "awaiting_confirmation",
            Self::GenerationStopped => "generation_stopped",
            Self::Internal(_)
            | Self::Provider(_)
            | Self::Store(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => "internal",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ParleyError::invalid("empty").code(), "invalid_argument");
        assert_eq!(ParleyError::QuotaExceeded.code(), "quota_exceeded");
        assert_eq!(ParleyError::GenerationStopped.code(), "generation_stopped");
        assert_eq!(ParleyError::Store("locked".into()).code(), "internal");
        assert_eq!(
            ParleyError::AwaitingConfirmation {
                tool_call_id: "call_1".into()
            }
            .code(),
            "awaiting_confirmation"
        );
    }
}
