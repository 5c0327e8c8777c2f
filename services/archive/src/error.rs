//! Error types shared across the archive engine.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias for archive engine operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Reason an access check rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Requested dates are older than the caller's day limit
    RetentionWindowExceeded,
    /// Requested service is outside the caller's allowlist
    ServiceNotAllowed,
    /// Hourly request quota used up
    RateLimited,
    /// Operation needs a higher access level
    InsufficientAccessLevel,
    /// No profile matches the presented credentials
    UnknownCaller,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::RetentionWindowExceeded => "retention window exceeded",
            DenyReason::ServiceNotAllowed => "service not allowed",
            DenyReason::RateLimited => "rate limited",
            DenyReason::InsufficientAccessLevel => "insufficient access level",
            DenyReason::UnknownCaller => "unknown caller",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the archive engine
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Key does not match the active archive layout
    #[error("Malformed archive path '{key}': {reason}")]
    MalformedPath { key: String, reason: String },

    /// A value cannot be used as a path component
    #[error("Invalid path component '{value}': {reason}")]
    InvalidComponent { value: String, reason: String },

    /// Object store could not be reached or refused the request
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Object does not exist
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Policy violation
    #[error("Access denied: {reason}")]
    AccessDenied { reason: DenyReason },

    /// Search criteria violate their invariants
    #[error("Invalid search criteria: {0}")]
    InvalidCriteria(String),

    /// Query deadline elapsed before the page was complete
    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Database collaborator failure
    #[error("Database error: {0}")]
    Database(String),

    /// No scheduled job with this name
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ArchiveError {
    pub fn malformed(key: &str, reason: impl Into<String>) -> Self {
        ArchiveError::MalformedPath {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn denied(reason: DenyReason) -> Self {
        ArchiveError::AccessDenied { reason }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ArchiveError::StorageUnavailable(_) | ArchiveError::Database(_)
        )
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ArchiveError::MalformedPath { .. } => "MALFORMED_PATH",
            ArchiveError::InvalidComponent { .. } => "INVALID_COMPONENT",
            ArchiveError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            ArchiveError::ObjectNotFound(_) | ArchiveError::UnknownJob(_) => "NOT_FOUND",
            ArchiveError::AccessDenied { reason } => match reason {
                DenyReason::RetentionWindowExceeded => "RETENTION_WINDOW_EXCEEDED",
                DenyReason::ServiceNotAllowed => "SERVICE_NOT_ALLOWED",
                DenyReason::RateLimited => "RATE_LIMITED",
                DenyReason::InsufficientAccessLevel => "INSUFFICIENT_ACCESS_LEVEL",
                DenyReason::UnknownCaller => "UNAUTHORIZED",
            },
            ArchiveError::InvalidCriteria(_) => "INVALID_CRITERIA",
            ArchiveError::Timeout(_) => "TIMEOUT",
            ArchiveError::Database(_) => "DATABASE_ERROR",
            ArchiveError::Config(_) => "CONFIG_ERROR",
            ArchiveError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<sqlx::Error> for ArchiveError {
    fn from(e: sqlx::Error) -> Self {
        ArchiveError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ArchiveError::StorageUnavailable("down".into()).is_transient());
        assert!(ArchiveError::Database("gone".into()).is_transient());
        assert!(!ArchiveError::denied(DenyReason::RateLimited).is_transient());
        assert!(!ArchiveError::malformed("a/b", "bad").is_transient());
    }

    #[test]
    fn test_access_denied_codes() {
        assert_eq!(
            ArchiveError::denied(DenyReason::RetentionWindowExceeded).code(),
            "RETENTION_WINDOW_EXCEEDED"
        );
        assert_eq!(ArchiveError::denied(DenyReason::RateLimited).code(), "RATE_LIMITED");
        assert_eq!(
            ArchiveError::denied(DenyReason::RateLimited).to_string(),
            "Access denied: rate limited"
        );
    }
}
