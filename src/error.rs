//! Error taxonomy for the registry engine
//!
//! Every public operation returns [`RegistryError`]. Validation and access
//! errors are raised close to the request boundary; persistence errors abort
//! the surrounding transaction.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no permission to {action} records of registry \"{resource}\"")]
    CapabilityDenied { resource: String, action: String },

    #[error("no permission to {action} records of registry \"{resource}\" in this territory")]
    TerritorialDenied { resource: String, action: String },

    #[error("validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("import aborted: row {row} has no recognizable columns")]
    StructuralImport { row: usize },

    #[error("registry descriptor build failed: {0}")]
    DescriptorBuild(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("external store error: {0}")]
    ExternalStore(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RegistryError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::CapabilityDenied { .. } => 403,
            Self::TerritorialDenied { .. } => 403,
            Self::Validation(_) => 422,
            Self::InvalidQuery(_) => 400,
            Self::StructuralImport { .. } => 422,
            Self::DescriptorBuild(_) => 500,
            Self::Persistence(_) => 500,
            Self::ExternalStore(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn invalid_value(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![ValidationIssue::new(column, message)])
    }
}

/// One failed check on one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub column: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column {}: {}", self.column, self.message)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_not_found() {
        assert_eq!(RegistryError::not_found("registry 1").http_status(), 404);
    }

    #[test]
    fn http_status_access_errors_are_forbidden() {
        let capability = RegistryError::CapabilityDenied {
            resource: "Wells".into(),
            action: "update".into(),
        };
        let territorial = RegistryError::TerritorialDenied {
            resource: "Wells".into(),
            action: "update".into(),
        };
        assert_eq!(capability.http_status(), 403);
        assert_eq!(territorial.http_status(), 403);
        assert_ne!(capability.to_string(), territorial.to_string());
    }

    #[test]
    fn validation_message_lists_columns() {
        let err = RegistryError::Validation(vec![
            ValidationIssue::new("depth", "cannot parse numeric value from 'abc'"),
            ValidationIssue::new("name", "required value is missing"),
        ]);
        let text = err.to_string();
        assert!(text.contains("column depth"));
        assert!(text.contains("column name"));
        assert_eq!(err.http_status(), 422);
    }

    #[test]
    fn http_status_external_store() {
        assert_eq!(RegistryError::ExternalStore("down".into()).http_status(), 502);
    }
}
