use thiserror::Error;

use crate::query::ast::Operator;
use crate::query::fields::AttributeType;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("{0} is not supported")]
    NotSupported(String),
    #[error("operator {op} is not supported for field {field}")]
    UnsupportedOperator { field: String, op: Operator },
    #[error("type mismatch for {field}: expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: AttributeType,
        got: &'static str,
    },
    #[error("invalid query: {0}")]
    Invalid(String),
    #[error("backend request failed: {0}")]
    Backend(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    BackendStatus { status: u16, body: String },
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl QueryError {
    /// The field a validation error is about, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            QueryError::NotSupported(field) => Some(field),
            QueryError::UnsupportedOperator { field, .. } => Some(field),
            QueryError::TypeMismatch { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Whether the caller's query is at fault rather than the backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QueryError::NotSupported(_)
                | QueryError::UnsupportedOperator { .. }
                | QueryError::TypeMismatch { .. }
                | QueryError::Invalid(_)
        )
    }
}
