//! Process mode selection

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    /// Consume log parts, store and broadcast them
    #[default]
    Streaming,
    /// Combine finished logs into archives (not available)
    Aggregate,
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessMode::Streaming => "streaming",
            ProcessMode::Aggregate => "aggregate",
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModeError {
    #[error("process mode '{0}' is not supported")]
    Unsupported(ProcessMode),
}

/// Aggregation mode entry point
///
/// Log aggregation and archival are not implemented; the mode exists so that
/// deployments selecting it fail loudly instead of silently consuming nothing.
pub fn run_aggregate() -> Result<(), ModeError> {
    warn!("Log aggregation is not implemented, nothing to do");
    Err(ModeError::Unsupported(ProcessMode::Aggregate))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_parse_from_cli_values() {
        assert_eq!(
            ProcessMode::from_str("streaming", true).unwrap(),
            ProcessMode::Streaming
        );
        assert_eq!(
            ProcessMode::from_str("AGGREGATE", true).unwrap(),
            ProcessMode::Aggregate
        );
        assert!(ProcessMode::from_str("batch", true).is_err());
        assert_eq!(ProcessMode::default(), ProcessMode::Streaming);
    }

    #[test]
    fn test_aggregate_is_unsupported() {
        let err = run_aggregate().unwrap_err();
        assert_eq!(err, ModeError::Unsupported(ProcessMode::Aggregate));
        assert_eq!(err.to_string(), "process mode 'aggregate' is not supported");
    }
}
