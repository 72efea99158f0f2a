//! Error taxonomy shared by the loader, the filter compiler and the query catalogue.
//!
//! Callers must be able to tell "nothing matched" apart from "the system could
//! not answer": an empty result is always `Ok(vec![])`, never a variant here.

use std::io;

use datafusion::error::DataFusionError;
use thiserror::Error;

/// Errors surfaced by `recsim_query`.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The snapshot could not be reached (missing file, download exhausted retries).
    #[error("snapshot '{reference}' is unavailable: {reason}")]
    SnapshotUnavailable { reference: String, reason: String },
    /// The snapshot was reachable but is not a usable dataset.
    #[error("snapshot '{reference}' is malformed: {reason}")]
    MalformedSnapshot { reference: String, reason: String },
    /// The caller supplied filters or paging outside their documented bounds.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("query engine failure: {0}")]
    Engine(#[from] DataFusionError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SnapshotUnavailable,
    MalformedSnapshot,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    /// Stable snake-case label used in logs and JSON error envelopes.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SnapshotUnavailable => "snapshot_unavailable",
            Self::MalformedSnapshot => "malformed_snapshot",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
        }
    }
}

impl QueryError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SnapshotUnavailable { .. } => ErrorKind::SnapshotUnavailable,
            Self::MalformedSnapshot { .. } => ErrorKind::MalformedSnapshot,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Engine(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` when the caller, not the system, is at fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_distinct_from_system_failure() {
        let rejected = QueryError::invalid("threshold 1.01 outside [0.5, 1.0]");
        assert!(rejected.is_rejection());
        assert_eq!(rejected.kind(), ErrorKind::InvalidRequest);

        let failed = QueryError::Engine(DataFusionError::Execution("boom".to_string()));
        assert!(!failed.is_rejection());
        assert_eq!(failed.kind().as_str(), "internal");
    }
}
