use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::construct::ColumnId;

/// One reason a write was refused. `column` is set when the problem is tied
/// to a specific column of the schema, `field` names the offending input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<ColumnId>,
    pub field: String,
    pub reason: String,
}

impl Violation {
    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            column: None,
            field: field.into(),
            reason: reason.into(),
        }
    }
    pub fn column(column: ColumnId, reason: impl Into<String>) -> Self {
        Self {
            column: Some(column),
            field: column.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Registry,
    Column,
    Record,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Kind::Registry => write!(f, "registry"),
            Kind::Column => write!(f, "column"),
            Kind::Record => write!(f, "record"),
        }
    }
}

fn joined(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("Validation failed: {}", joined(.violations))]
    Validation { violations: Vec<Violation> },
    #[error("Unknown {kind} {id}")]
    NotFound { kind: Kind, id: String },
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Export error: {0}")]
    Export(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, RegistrarError>;

impl RegistrarError {
    pub fn invalid(violations: Vec<Violation>) -> Self {
        Self::Validation { violations }
    }
    pub fn not_found(kind: Kind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
    /// True for failures caused by the caller's input rather than the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::NotFound { .. })
    }
}

// Helper conversions
impl From<rusqlite::Error> for RegistrarError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
impl From<serde_json::Error> for RegistrarError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
impl From<csv::Error> for RegistrarError {
    fn from(e: csv::Error) -> Self {
        Self::Export(e.to_string())
    }
}
impl From<config::ConfigError> for RegistrarError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl<T> From<std::sync::PoisonError<T>> for RegistrarError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
