use thiserror::Error;

/// Main error type for the Koopweave system
#[derive(Error, Debug)]
pub enum KoopError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl KoopError {
    /// Configuration errors are fatal and must never be retried.
    pub fn is_configuration(&self) -> bool {
        match self {
            KoopError::Config(_) => true,
            KoopError::Model(err) => err.is_configuration(),
            _ => false,
        }
    }
}

/// Data-related errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Episode {index} has width {actual}, expected {expected}")]
    WidthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Duplicate episode index: {index}")]
    DuplicateEpisode { index: usize },

    #[error("Episode {index} contains no samples")]
    EmptyEpisode { index: usize },

    #[error("Invalid episode marker {value} at row {row}")]
    InvalidMarker { row: usize, value: f64 },

    #[error("Invalid data format: {message}")]
    InvalidFormat { message: String },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Data loading failed: {message}")]
    LoadingFailed { message: String },

    #[error("Data parsing error: {message}")]
    ParseError { message: String },
}

/// Model identification and composition errors
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Dimension mismatch in {context}: expected {expected_rows}x{expected_cols}, got {actual_rows}x{actual_cols}")]
    DimensionMismatch {
        context: String,
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    #[error("Coefficient matrix is {actual_rows}x{actual_cols}, lifted system expects {expected_rows}x{expected_cols}")]
    CoefficientShape {
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    #[error("Invalid controller realization: {message}")]
    InvalidController { message: String },

    #[error("Invalid regularization strength: {alpha}")]
    InvalidRegularization { alpha: f64 },

    #[error("Invalid lifting function: {message}")]
    InvalidLifting { message: String },

    #[error("{component} has not been fit")]
    NotFitted { component: String },

    #[error("Episode {index} has {length} samples, at least {required} required")]
    EpisodeTooShort {
        index: usize,
        length: usize,
        required: usize,
    },

    #[error("Regression failed: {message}")]
    RegressionFailed { message: String },
}

impl ModelError {
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ModelError::DimensionMismatch { .. }
                | ModelError::CoefficientShape { .. }
                | ModelError::InvalidController { .. }
                | ModelError::InvalidRegularization { .. }
                | ModelError::InvalidLifting { .. }
        )
    }
}

/// Result type alias for Koopweave operations
pub type KoopResult<T> = Result<T, KoopError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::KoopError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::KoopError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::KoopError::Config(format!($($arg)*))
    };
}
