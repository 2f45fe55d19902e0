use std::fmt;

use koop_optimizer::OptimizerError;
use koop_types::KoopError;
use thiserror::Error;

/// How one worker process ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the exit status could not be collected.
    pub wait_error: Option<String>,
}

impl WorkerFailure {
    pub fn exited(pid: u32, code: Option<i32>, signal: Option<i32>) -> Self {
        Self {
            pid,
            code,
            signal,
            wait_error: None,
        }
    }

    pub fn unwaited(pid: u32, error: &std::io::Error) -> Self {
        Self {
            pid,
            code: None,
            signal: None,
            wait_error: Some(error.to_string()),
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.wait_error {
            return write!(f, "pid {} could not be waited on: {}", self.pid, error);
        }
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "pid {} exited with code {}", self.pid, code),
            (None, Some(signal)) => write!(f, "pid {} was killed by signal {}", self.pid, signal),
            (None, None) => write!(f, "pid {} ended without an exit code", self.pid),
        }
    }
}

fn describe(failures: &[WorkerFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Koop(#[from] KoopError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error("Failed to launch worker {index} ({program}): {source}")]
    Spawn {
        index: usize,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{} worker process(es) failed: {}", .failures.len(), describe(.failures))]
    WorkersFailed { failures: Vec<WorkerFailure> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_configuration(&self) -> bool {
        match self {
            EngineError::Config(_) => true,
            EngineError::Koop(err) => err.is_configuration(),
            EngineError::Optimizer(OptimizerError::InvalidSearchSpace { .. }) => true,
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
