//! Typed errors for the two failure boundaries of the pipeline.
//!
//! `DataIntegrityError` means the input does not match the modeling
//! assumptions and aborts the run. `ModelFitError` is recoverable: the caller
//! turns it into a diagnostic message and finishes normally.

use thiserror::Error;

/// The prepared observation table violates the two-category / no-missing
/// invariant, or cannot be built at all.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataIntegrityError {
    /// A configured source column is not present in the input.
    #[error("column `{column}` not found in input")]
    MissingColumn { column: String },

    /// A source column could not be read as text.
    #[error("column `{column}` could not be read: {message}")]
    Unreadable { column: String, message: String },

    /// A value would introduce a category outside the fixed two-level set.
    #[error("column `{column}` has value `{value}` at row {row}; expected a two-category indicator")]
    UnexpectedCategory {
        column: String,
        row: usize,
        value: String,
    },

    /// The input contains no data rows.
    #[error("input table has no rows")]
    EmptyTable,
}

impl DataIntegrityError {
    /// Source column the error refers to, if any.
    pub fn column(&self) -> Option<&str> {
        match self {
            DataIntegrityError::MissingColumn { column }
            | DataIntegrityError::Unreadable { column, .. }
            | DataIntegrityError::UnexpectedCategory { column, .. } => Some(column),
            DataIntegrityError::EmptyTable => None,
        }
    }
}

/// Expectation-maximization could not produce a usable parameter set.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelFitError {
    #[error("no observations to fit")]
    EmptyInput,

    #[error("{observations} observations are too few for a {states}-state model")]
    TooFewObservations { observations: usize, states: usize },

    #[error("EM did not converge after {iterations} iterations (last relative change {last_change:.3e})")]
    NotConverged { iterations: usize, last_change: f64 },

    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

impl ModelFitError {
    /// Suggested next step shown alongside the diagnostic.
    pub fn remediation(&self) -> &'static str {
        match self {
            ModelFitError::EmptyInput | ModelFitError::TooFewObservations { .. } => {
                "Inspect the prepared table: the input may be filtered down to too few customers."
            }
            ModelFitError::NotConverged { .. } => {
                "Raise --max-iters, loosen --tolerance, or try a different --seed."
            }
            ModelFitError::NumericalInstability(_) | ModelFitError::InvalidParameters(_) => {
                "Inspect the prepared table and check the source columns for missing or constant values."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_names_column() {
        let err = DataIntegrityError::UnexpectedCategory {
            column: "9Online".to_string(),
            row: 3,
            value: "2".to_string(),
        };
        assert_eq!(err.column(), Some("9Online"));
        assert!(err.to_string().contains("9Online"));
        assert!(err.to_string().contains("row 3"));
        assert_eq!(DataIntegrityError::EmptyTable.column(), None);
    }

    #[test]
    fn test_fit_error_has_remediation() {
        let err = ModelFitError::NotConverged {
            iterations: 10,
            last_change: 1e-3,
        };
        assert!(err.to_string().contains("10 iterations"));
        assert!(err.remediation().contains("--max-iters"));
        assert!(ModelFitError::EmptyInput
            .remediation()
            .contains("prepared table"));
    }
}
