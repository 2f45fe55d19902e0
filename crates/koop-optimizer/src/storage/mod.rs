//! Persistent study storage shared by worker processes.

use rand::Rng;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{OptimizerError, OptimizerResult};
use crate::trial::{select_best, FrozenTrial, ObjectiveDirection, StudyConfig, TrialState};

mod duckdb_store;
mod memory;

pub use self::duckdb_store::DuckDbStorage;
pub use self::memory::InMemoryStorage;

/// A study as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStudy {
    pub id: i64,
    pub config: StudyConfig,
}

/// Operations every study backend provides. Implementations must be safe to
/// call from several processes (or threads) at once.
pub trait StudyStorage: Send + Sync {
    /// Register a new study; fails if the name is taken.
    fn create_study(&self, config: &StudyConfig) -> OptimizerResult<i64>;

    /// Load a study by name, or the only study when `name` is `None`.
    fn load_study(&self, name: Option<&str>) -> OptimizerResult<StoredStudy>;

    /// Start a new running trial and return its number. Numbers are unique
    /// and contiguous per study.
    fn create_trial(&self, study_id: i64, worker_id: &str) -> OptimizerResult<usize>;

    fn set_trial_param(&self, study_id: i64, number: usize, name: &str, value: f64) -> OptimizerResult<()>;

    fn report_intermediate(&self, study_id: i64, number: usize, step: usize, value: f64) -> OptimizerResult<()>;

    /// Move a running trial to a terminal state.
    fn finalize_trial(
        &self,
        study_id: i64,
        number: usize,
        state: TrialState,
        value: Option<f64>,
        error: Option<&str>,
    ) -> OptimizerResult<()>;

    fn trials(&self, study_id: i64) -> OptimizerResult<Vec<FrozenTrial>>;

    fn trial(&self, study_id: i64, number: usize) -> OptimizerResult<FrozenTrial> {
        self.trials(study_id)?
            .into_iter()
            .find(|t| t.number == number)
            .ok_or(OptimizerError::TrialNotFound { number })
    }

    fn best_trial(&self, study_id: i64, direction: ObjectiveDirection) -> OptimizerResult<FrozenTrial> {
        select_best(&self.trials(study_id)?, direction)
    }
}

/// Where a study lives: `duckdb://<path>`, a bare file path, or `memory://`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUrl {
    DuckDb(PathBuf),
    Memory,
}

impl StorageUrl {
    pub fn parse(url: &str) -> OptimizerResult<Self> {
        let invalid = || OptimizerError::InvalidStorageUrl { url: url.to_string() };
        let url_trimmed = url.trim();
        if url_trimmed == "memory://" {
            return Ok(StorageUrl::Memory);
        }
        let path = match url_trimmed.strip_prefix("duckdb://") {
            Some(path) => path,
            None if url_trimmed.contains("://") => return Err(invalid()),
            None => url_trimmed,
        };
        if path.is_empty() {
            return Err(invalid());
        }
        Ok(StorageUrl::DuckDb(PathBuf::from(path)))
    }

    /// Open the storage, creating the schema if needed.
    pub fn open(&self) -> OptimizerResult<Arc<dyn StudyStorage>> {
        match self {
            StorageUrl::DuckDb(path) => Ok(Arc::new(DuckDbStorage::open(path)?)),
            StorageUrl::Memory => Ok(Arc::new(InMemoryStorage::new())),
        }
    }

    /// Wipe any existing study data and open a fresh store.
    pub fn recreate(&self) -> OptimizerResult<Arc<dyn StudyStorage>> {
        match self {
            StorageUrl::DuckDb(path) => Ok(Arc::new(DuckDbStorage::recreate(path)?)),
            StorageUrl::Memory => Ok(Arc::new(InMemoryStorage::new())),
        }
    }
}

impl FromStr for StorageUrl {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageUrl::parse(s)
    }
}

impl fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageUrl::DuckDb(path) => write!(f, "duckdb://{}", path.display()),
            StorageUrl::Memory => write!(f, "memory://"),
        }
    }
}

/// Bounded exponential backoff with jitter for lock and conflict errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): half the exponential
    /// step plus up to half again of jitter, capped at `max_delay`.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let half = exp / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        (half + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    pub(crate) fn run<T>(&self, operation: &str, mut f: impl FnMut() -> OptimizerResult<T>) -> OptimizerResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Err(err) if is_busy(&err) => {
                    if attempt >= self.max_attempts.max(1) {
                        return Err(OptimizerError::StorageBusy {
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = self.delay(attempt);
                    debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "storage busy, retrying");
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }
}

fn is_busy(err: &OptimizerError) -> bool {
    match err {
        OptimizerError::Storage { message } => {
            let message = message.to_ascii_lowercase();
            message.contains("lock") || message.contains("conflict")
        }
        _ => false,
    }
}
