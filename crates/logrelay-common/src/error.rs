//! Error types shared by logrelay crates

use thiserror::Error;

/// Result type alias for logrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Configuration errors raised before the worker starts
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0} was empty")]
    MissingVar(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidVar { name: String, reason: String },
}

impl RelayError {
    /// Missing or blank environment variable
    pub fn missing(name: &str) -> Self {
        Self::MissingVar(name.to_string())
    }

    /// Environment variable present but unusable
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidVar {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_var_message_names_variable() {
        let err = RelayError::missing("AMQP_URL");
        assert_eq!(err.to_string(), "AMQP_URL was empty");
    }

    #[test]
    fn test_invalid_var_message() {
        let err = RelayError::invalid("LOGRELAY_WORKERS", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid value for LOGRELAY_WORKERS: must be greater than 0"
        );
    }
}
