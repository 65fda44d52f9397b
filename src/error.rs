use std::time::Duration;

/// Custom error type for change_dispatch operations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Secret unavailable: {0}")]
    SecretUnavailable(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Pipeline '{pipeline}' failed to start: {message}")]
    TriggerFailure { pipeline: String, message: String },

    #[error("Pipeline '{pipeline}' did not acknowledge start within {timeout:?}")]
    TriggerTimeout { pipeline: String, timeout: Duration },
}

impl DispatchError {
    /// Shorthand for a trigger failure on a named pipeline.
    pub fn trigger(pipeline: &str, message: impl Into<String>) -> Self {
        DispatchError::TriggerFailure {
            pipeline: pipeline.to_string(),
            message: message.into(),
        }
    }
}

/// Helper type for Results that use DispatchError
pub type Result<T> = std::result::Result<T, DispatchError>;
