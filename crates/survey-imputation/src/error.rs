//! Custom error types for the imputation engine.
//!
//! This module provides the error hierarchy using `thiserror`. Every fatal
//! condition aborts the whole batch: the engine never hands back a partially
//! imputed table. QA tables built before the failure travel with the error
//! (see [`ImputationError::partial_qa`]).
//!
//! Errors are serializable so a front-end can display them as `{code, message}`.

use crate::config::ConfigValidationError;
use crate::types::{LinkFactorQaRow, TrimQaRow};
use serde::Serialize;
use serde::ser::SerializeStruct;
use thiserror::Error;

/// The main error type for the imputation engine.
#[derive(Error, Debug)]
pub enum ImputationError {
    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    /// A configured variable is not a field of the input table.
    #[error("Configured variable '{0}' is not a field of the input table")]
    UnknownVariable(String),

    /// A field required by a stage is missing.
    #[error("Required field '{field}' missing at {stage}")]
    MissingField { stage: &'static str, field: String },

    /// A cell could not be parsed into the expected domain value.
    #[error("Invalid value '{value}' in column '{column}'")]
    InvalidValue { column: String, value: String },

    /// The same (reference, instance) appeared twice.
    #[error("Duplicate record at {stage}: reference {reference}, instance {instance}")]
    DuplicateRecord {
        stage: &'static str,
        reference: i64,
        instance: String,
    },

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Polars error wrapper.
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stage failed after QA tables were already built.
    #[error("{source}")]
    Incomplete {
        #[source]
        source: Box<ImputationError>,
        trim_qa: Vec<TrimQaRow>,
        link_qa: Vec<LinkFactorQaRow>,
    },

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ImputationError>,
    },
}

impl ImputationError {
    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ImputationError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Attach QA tables built before the failure. Tables already attached
    /// are kept and extended.
    pub fn with_qa(self, trim_qa: Vec<TrimQaRow>, link_qa: Vec<LinkFactorQaRow>) -> Self {
        match self {
            ImputationError::Incomplete {
                source,
                trim_qa: mut kept_trim,
                link_qa: mut kept_link,
            } => {
                kept_trim.extend(trim_qa);
                kept_link.extend(link_qa);
                ImputationError::Incomplete {
                    source,
                    trim_qa: kept_trim,
                    link_qa: kept_link,
                }
            }
            other => ImputationError::Incomplete {
                source: Box::new(other),
                trim_qa,
                link_qa,
            },
        }
    }

    /// QA tables that were built before the run failed.
    pub fn partial_qa(&self) -> Option<(&[TrimQaRow], &[LinkFactorQaRow])> {
        match self {
            Self::Incomplete {
                trim_qa, link_qa, ..
            } => Some((trim_qa, link_qa)),
            Self::WithContext { source, .. } => source.partial_qa(),
            _ => None,
        }
    }

    /// Build a duplicate-record fault from a record key.
    pub fn duplicate(stage: &'static str, reference: i64, instance: Option<i64>) -> Self {
        ImputationError::DuplicateRecord {
            stage,
            reference,
            instance: instance.map_or_else(|| "unset".to_string(), |i| i.to_string()),
        }
    }

    /// Get error code for front-end handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::UnknownVariable(_) => "UNKNOWN_VARIABLE",
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::DuplicateRecord { .. } => "DUPLICATE_RECORD",
            Self::Io(_) => "IO_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Incomplete { source, .. } | Self::WithContext { source, .. } => {
                source.error_code()
            }
        }
    }

    /// Check if this error was raised before any record was processed.
    pub fn is_fatal_config(&self) -> bool {
        match self {
            Self::InvalidConfig(_) | Self::UnknownVariable(_) => true,
            Self::Incomplete { source, .. } | Self::WithContext { source, .. } => {
                source.is_fatal_config()
            }
            _ => false,
        }
    }
}

impl Serialize for ImputationError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("ImputationError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for imputation operations.
pub type Result<T> = std::result::Result<T, ImputationError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, polars::error::PolarsError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ImputationError::Polars(e).with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(
            ImputationError::UnknownVariable("211".to_string()).error_code(),
            "UNKNOWN_VARIABLE"
        );
        assert_eq!(
            ImputationError::duplicate("recombination", 1001, Some(1)).error_code(),
            "DUPLICATE_RECORD"
        );
    }

    #[test]
    fn test_duplicate_message_names_the_key() {
        let error = ImputationError::duplicate("input", 1001, None);
        let message = error.to_string();
        assert!(message.contains("1001"));
        assert!(message.contains("unset"));
        assert!(message.contains("at input"));
    }

    #[test]
    fn test_is_fatal_config() {
        assert!(ImputationError::UnknownVariable("x".to_string()).is_fatal_config());
        assert!(
            ImputationError::UnknownVariable("x".to_string())
                .with_context("Validating schema")
                .is_fatal_config()
        );
        assert!(!ImputationError::duplicate("input", 1, Some(0)).is_fatal_config());
    }

    #[test]
    fn test_error_serialization() {
        let error = ImputationError::MissingField {
            stage: "apportionment",
            field: "211".to_string(),
        };
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("MISSING_FIELD"));
        assert!(json.contains("apportionment"));
    }

    #[test]
    fn test_with_context() {
        let error = ImputationError::UnknownVariable("emp_total".to_string())
            .with_context("During schema validation");
        assert!(error.to_string().contains("During schema validation"));
        assert_eq!(error.error_code(), "UNKNOWN_VARIABLE");
    }

    #[test]
    fn test_qa_travels_with_error() {
        let row = LinkFactorQaRow {
            class: "C_AA".to_string(),
            variable: "211".to_string(),
            link_factor: 1.0,
            pair_count: 1,
            defaulted: true,
        };
        let error = ImputationError::duplicate("recombination", 1, Some(1))
            .with_qa(Vec::new(), vec![row.clone()])
            .with_qa(Vec::new(), vec![row]);

        assert_eq!(error.error_code(), "DUPLICATE_RECORD");
        assert!(error.to_string().starts_with("Duplicate record at recombination"));
        let (trim_qa, link_qa) = error.partial_qa().unwrap();
        assert!(trim_qa.is_empty());
        assert_eq!(link_qa.len(), 2);
        assert!(ImputationError::UnknownVariable("x".to_string()).partial_qa().is_none());
    }
}
