//! Typed errors and backend error classification.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while compiling entities or building queries. These are caller bugs
/// (bad field name, malformed filter) and are never worth retrying.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("unknown field '{field}' on table {table}")]
    UnknownField { table: String, field: String },
    #[error("operator {operator} on '{field}' expects {expected}")]
    InvalidFilterValue {
        field: String,
        operator: &'static str,
        expected: &'static str,
    },
    #[error("raw fragment must use each of $1..${params} (highest used: ${placeholders})")]
    RawPlaceholderMismatch { placeholders: usize, params: usize },
    #[error("nothing to write: {0}")]
    EmptyWrite(String),
    #[error("table {0} has no deleted_at column")]
    SoftDeleteUnsupported(String),
    #[error("invalid expression: {0}")]
    Expression(String),
}

/// One caller-correctable problem with one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// All field problems found in a record. Raised before any SQL is issued.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, message);
        errors
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Ok when nothing was collected, otherwise the collected errors as a `DbError`.
    pub fn into_result(self) -> Result<(), DbError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DbError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::Check => "check",
            ConstraintKind::NotNull => "not null",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("validation: {0}")]
    Validation(ValidationErrors),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{kind} constraint violated{}: {message}", constraint.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    Constraint {
        kind: ConstraintKind,
        constraint: Option<String>,
        message: String,
    },
    #[error("migration {migration} failed: {message}")]
    Migration { migration: String, message: String },
    #[error("connection: {0}")]
    Connection(String),
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("config: {0}")]
    Config(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(sqlx::Error),
}

/// SQLSTATE codes for "relation/column/object already exists".
const ALREADY_EXISTS_CODES: &[&str] = &["42P07", "42701", "42710", "42P06"];

impl DbError {
    /// True only for the duplicate-object class that idempotent DDL may ignore.
    pub fn is_already_exists(&self) -> bool {
        match self {
            DbError::Database(sqlx::Error::Database(db)) => db
                .code()
                .map(|c| ALREADY_EXISTS_CODES.contains(&c.as_ref()))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Short stable code for callers that map errors onto their own transport.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::Validation(_) => "validation_error",
            DbError::NotFound(_) => "not_found",
            DbError::Constraint { .. } => "constraint_violation",
            DbError::Migration { .. } => "migration_error",
            DbError::Connection(_) => "connection_error",
            DbError::Timeout(_) => "timeout",
            DbError::Query(_) => "query_error",
            DbError::Config(_) => "config_error",
            DbError::Serialization(_) => "serialization_error",
            DbError::Database(_) => "database_error",
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => {
                let kind = match db.code().as_deref() {
                    Some("23505") => Some(ConstraintKind::Unique),
                    Some("23503") => Some(ConstraintKind::ForeignKey),
                    Some("23514") => Some(ConstraintKind::Check),
                    Some("23502") => Some(ConstraintKind::NotNull),
                    _ => None,
                };
                match kind {
                    Some(kind) => DbError::Constraint {
                        kind,
                        constraint: db.constraint().map(String::from),
                        message: db.message().to_string(),
                    },
                    None => DbError::Database(sqlx::Error::Database(db)),
                }
            }
            sqlx::Error::PoolTimedOut => DbError::Connection("timed out acquiring a pooled connection".into()),
            sqlx::Error::PoolClosed => DbError::Connection("connection pool is closed".into()),
            sqlx::Error::Io(io) => DbError::Connection(format!("io: {}", io)),
            sqlx::Error::Tls(tls) => DbError::Connection(format!("tls: {}", tls)),
            sqlx::Error::Protocol(msg) => DbError::Connection(format!("protocol: {}", msg)),
            other => DbError::Database(other),
        }
    }
}
