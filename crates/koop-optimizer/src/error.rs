use thiserror::Error;

use crate::trial::TrialState;

/// Errors raised by studies, samplers and study storage.
#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage busy after {attempts} attempt(s): {message}")]
    StorageBusy { attempts: u32, message: String },

    #[error("Unsupported storage URL: {url}")]
    InvalidStorageUrl { url: String },

    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Study name is required when the storage holds {count} studies")]
    AmbiguousStudy { count: usize },

    #[error("Study already exists: {name}")]
    DuplicateStudy { name: String },

    #[error("Trial {number} not found")]
    TrialNotFound { number: usize },

    #[error("Trial {number} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        number: usize,
        from: TrialState,
        to: TrialState,
    },

    #[error("Parameter '{name}' is not in the search space")]
    UnknownParameter { name: String },

    #[error("Invalid search space: {message}")]
    InvalidSearchSpace { message: String },

    #[error("No completed trials")]
    NoCompletedTrials,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<duckdb::Error> for OptimizerError {
    fn from(err: duckdb::Error) -> Self {
        OptimizerError::Storage {
            message: err.to_string(),
        }
    }
}

pub type OptimizerResult<T> = Result<T, OptimizerError>;
