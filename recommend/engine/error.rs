use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation check that rejected an interaction payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InputErrorKind {
    /// The payload is not a recognised tabular layout.
    FormatError,
    /// A required column is absent.
    ColumnError,
    /// A value cannot be coerced to the column's integer type.
    TypeError,
    /// A `(user_id, prod_id)` pair occurs more than once.
    UniqueError,
}

impl InputErrorKind {
    /// Taxonomy tag reported to callers.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::FormatError => "format_error",
            Self::ColumnError => "column_error",
            Self::TypeError => "type_error",
            Self::UniqueError => "unique_error",
        }
    }
}

impl fmt::Display for InputErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Malformed interaction payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct InputDataError {
    kind: InputErrorKind,
    detail: String,
}

impl InputDataError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: InputErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Payload could not be parsed as a table.
    #[must_use]
    pub fn format(detail: impl Into<String>) -> Self {
        Self::new(InputErrorKind::FormatError, detail)
    }

    /// One or more required columns are missing.
    #[must_use]
    pub fn missing_columns(missing: &[&str]) -> Self {
        Self::new(
            InputErrorKind::ColumnError,
            format!("missing required column(s): {}", missing.join(", ")),
        )
    }

    /// A cell could not be coerced to an integer.
    #[must_use]
    pub fn not_integer(column: &str, row: usize, value: &str) -> Self {
        Self::new(
            InputErrorKind::TypeError,
            format!("column {column} row {row}: {value} is not a valid integer"),
        )
    }

    /// A `(user_id, prod_id)` pair repeats.
    #[must_use]
    pub fn duplicate_pair(user_id: u32, prod_id: u32, duplicates: usize) -> Self {
        Self::new(
            InputErrorKind::UniqueError,
            format!(
                "({user_id}, {prod_id}) is repeated; {duplicates} duplicate pair(s) in total"
            ),
        )
    }

    /// Which check failed.
    #[must_use]
    pub const fn kind(&self) -> InputErrorKind {
        self.kind
    }

    /// Human readable description of the offending input.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Flag-style lookup: did the `kind` check fail?
    #[must_use]
    pub fn is(&self, kind: InputErrorKind) -> bool {
        self.kind == kind
    }
}

/// Errors surfaced by engine and cross-validation operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Interaction payload failed validation.
    #[error("input data error: {0}")]
    InputData(#[from] InputDataError),
    /// Training was attempted without usable data.
    #[error("training error: {0}")]
    Training(String),
    /// Recommendations were requested before any model was trained or loaded.
    #[error("no trained model is available")]
    ModelNotTrained,
    /// Model directory is unwritable, missing, or incomplete.
    #[error("persistence error at {}: {message}", path.display())]
    Persistence {
        /// Model directory involved.
        path: PathBuf,
        /// Failure description.
        message: String,
    },
    /// Invalid argument (fold count, hyperparameter name or value).
    #[error("invalid value: {0}")]
    Value(String),
}

impl EngineError {
    /// Taxonomy tag identifying the failed check.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::InputData(err) => err.kind().tag(),
            Self::Training(_) => "training_error",
            Self::ModelNotTrained => "model_not_trained_error",
            Self::Persistence { .. } => "persistence_error",
            Self::Value(_) => "value_error",
        }
    }

    pub(crate) fn persistence(path: &Path, message: impl fmt::Display) -> Self {
        Self::Persistence {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_identify_failed_check() {
        let err: EngineError = InputDataError::missing_columns(&["user_id"]).into();
        assert_eq!(err.tag(), "column_error");
        assert_eq!(EngineError::ModelNotTrained.tag(), "model_not_trained_error");
        assert_eq!(
            EngineError::persistence(Path::new("m"), "missing metadata").tag(),
            "persistence_error"
        );
    }

    #[test]
    fn flag_lookup_matches_kind_only() {
        let err = InputDataError::not_integer("rating", 0, "A");
        assert!(err.is(InputErrorKind::TypeError));
        assert!(!err.is(InputErrorKind::UniqueError));
        assert!(err.to_string().starts_with("type_error"));
    }
}
