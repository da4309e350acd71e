//! Error types for network resiliency

use thiserror::Error;

/// Result type alias for network resiliency
pub type Result<T> = std::result::Result<T, ResiliencyError>;

/// Main error type for network resiliency
#[derive(Debug, Error)]
pub enum ResiliencyError {
    /// A sample, percentile or percentage that can never be valid
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// A bad mode, unit, action or adapter identifier
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The remote statistics store could not be reached or misbehaved
    #[error("Backend error: {0}")]
    Backend(String),

    /// Unexpected failure while computing timeouts or recording stats
    #[error("Policy computation error: {message}")]
    Policy { message: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResiliencyError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Short name used to tag error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "InvalidInput",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::Backend(_) => "Backend",
            Self::Policy { .. } => "Policy",
            Self::Config(_) => "Config",
            Self::Serialization(_) => "Serialization",
            Self::Io(_) => "Io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ResiliencyError::invalid_input("percentile must be between 0 and 100");
        assert_eq!(
            err.to_string(),
            "Invalid input: percentile must be between 0 and 100"
        );

        let err = ResiliencyError::Backend("connection refused".to_string());
        assert_eq!(err.to_string(), "Backend error: connection refused");
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<u64>("nope").unwrap_err();
        let err: ResiliencyError = serde_err.into();
        assert!(matches!(err, ResiliencyError::Serialization(_)));
        assert_eq!(err.kind(), "Serialization");
    }

    #[test]
    fn test_error_chaining() {
        fn might_fail() -> Result<()> {
            Err(ResiliencyError::invalid_argument("invalid units: minutes"))
        }

        let result = might_fail();
        assert!(matches!(
            result,
            Err(ResiliencyError::InvalidArgument { .. })
        ));
    }
}
