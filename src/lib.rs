//! churnstate: customer retention state analysis with a categorical Hidden Markov Model
//!
//! This library recodes customer channel usage and retention into two-level
//! categorical observations, fits a 4-state HMM by expectation-maximization,
//! and labels the hidden states from their emission probabilities.

pub mod cli;
pub mod data;
pub mod error;
pub mod labels;
pub mod logging;
pub mod model;
pub mod report;

// Re-export public items for easier access
pub use cli::Args;
pub use data::{load_and_prepare, prepare_observations, ColumnMap, ObservationTable, PreparedData};
pub use error::{DataIntegrityError, ModelFitError};
pub use labels::label_states;
pub use model::{fit_hmm, FitConfig, FittedHmm, HmmParams, NUM_STATES};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
