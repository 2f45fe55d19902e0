//! Search and evaluation configuration.

use clap::ValueEnum;
use koop_data::read_json;
use koop_model::LiftingSet;
use koop_optimizer::{ObjectiveDirection, PrunerConfig, SamplerConfig, SearchSpace, StorageUrl, StudyConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Name of the searched regularization parameter.
pub const ALPHA: &str = "alpha";

/// Which plant estimate a study tunes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StudyKind {
    /// EDMD on closed-loop data through the known controller.
    ClosedLoop,
    /// EDMD on open-loop data, then closed around the controller.
    OpenLoop,
}

impl StudyKind {
    pub const ALL: [StudyKind; 2] = [StudyKind::ClosedLoop, StudyKind::OpenLoop];

    /// Study name and storage file stem.
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyKind::ClosedLoop => "closed_loop",
            StudyKind::OpenLoop => "open_loop",
        }
    }

    /// Spelling used on the worker command line.
    pub fn cli_name(&self) -> &'static str {
        match self {
            StudyKind::ClosedLoop => "closed-loop",
            StudyKind::OpenLoop => "open-loop",
        }
    }
}

impl fmt::Display for StudyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the search driver needs; missing JSON fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Dataset recorded under the training controller.
    pub dataset_path: PathBuf,
    /// Dataset recorded under the evaluation controller.
    pub transfer_dataset_path: PathBuf,
    pub lifting_path: PathBuf,
    /// Directory holding one study database per [`StudyKind`].
    pub study_dir: PathBuf,
    pub report_path: PathBuf,

    pub lifting: LiftingSet,

    pub n_processes: usize,
    /// Trials per worker process.
    pub n_trials: usize,
    pub n_splits: usize,
    pub test_size: f64,
    pub split_seed: u64,

    pub alpha_low: f64,
    pub alpha_high: f64,
    pub direction: ObjectiveDirection,
    pub sampler: SamplerConfig,
    pub pruner: PrunerConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("build/dataset_training_controller.json"),
            transfer_dataset_path: PathBuf::from("build/dataset_test_controller.json"),
            lifting_path: PathBuf::from("build/lifting_functions.json"),
            study_dir: PathBuf::from("build/studies"),
            report_path: PathBuf::from("build/evaluation.json"),
            lifting: LiftingSet::standard(),
            n_processes: 6,
            n_trials: 30,
            n_splits: 3,
            test_size: 0.2,
            split_seed: 1234,
            alpha_low: 1e-12,
            alpha_high: 1e12,
            direction: ObjectiveDirection::Maximize,
            sampler: SamplerConfig::default(),
            pruner: PrunerConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_dataset(mut self, training: impl Into<PathBuf>, transfer: impl Into<PathBuf>) -> Self {
        self.dataset_path = training.into();
        self.transfer_dataset_path = transfer.into();
        self
    }

    pub fn with_study_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.study_dir = dir.into();
        self
    }

    pub fn with_lifting(mut self, path: impl Into<PathBuf>, lifting: LiftingSet) -> Self {
        self.lifting_path = path.into();
        self.lifting = lifting;
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = path.into();
        self
    }

    pub fn with_processes(mut self, n_processes: usize, n_trials: usize) -> Self {
        self.n_processes = n_processes;
        self.n_trials = n_trials;
        self
    }

    pub fn with_splits(mut self, n_splits: usize, test_size: f64, split_seed: u64) -> Self {
        self.n_splits = n_splits;
        self.test_size = test_size;
        self.split_seed = split_seed;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_pruner(mut self, pruner: PrunerConfig) -> Self {
        self.pruner = pruner;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.n_processes == 0 || self.n_trials == 0 {
            return Err(EngineError::Config(format!(
                "need at least one process and one trial, got {} x {}",
                self.n_processes, self.n_trials
            )));
        }
        if self.n_splits == 0 {
            return Err(EngineError::Config("n_splits must be positive".to_string()));
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(EngineError::Config(format!(
                "test_size must lie in (0, 1), got {}",
                self.test_size
            )));
        }
        self.search_space().validate()?;
        Ok(())
    }

    pub fn search_space(&self) -> SearchSpace {
        SearchSpace::new().add_log_uniform(ALPHA, self.alpha_low, self.alpha_high)
    }

    pub fn study_config(&self, kind: StudyKind) -> StudyConfig {
        StudyConfig::new(kind.as_str(), self.search_space())
            .with_direction(self.direction)
            .with_sampler(self.sampler)
            .with_pruner(self.pruner)
    }

    pub fn storage_url(&self, kind: StudyKind) -> StorageUrl {
        StorageUrl::DuckDb(self.study_dir.join(format!("{}.db", kind.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_reference_search() {
        let config = SearchConfig::default();
        assert_eq!((config.n_processes, config.n_trials), (6, 30));
        assert_eq!((config.n_splits, config.split_seed), (3, 1234));
        assert_eq!(config.test_size, 0.2);
        assert!(matches!(config.sampler, SamplerConfig::Tpe { seed: 3501, .. }));
        assert!(matches!(config.pruner, PrunerConfig::Threshold { lower: Some(l), .. } if l == -10.0));
        assert_eq!(config.direction, ObjectiveDirection::Maximize);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("search.json");
        std::fs::write(&path, r#"{ "n_processes": 2, "n_trials": 4, "study_dir": "out/studies" }"#).unwrap();
        let config = SearchConfig::load(&path).unwrap();
        assert_eq!(config.n_processes, 2);
        assert_eq!(config.n_splits, 3);
        assert_eq!(
            config.storage_url(StudyKind::OpenLoop),
            StorageUrl::DuckDb(PathBuf::from("out/studies/open_loop.db"))
        );
    }

    #[test]
    fn invalid_settings_are_configuration_errors() {
        let bad = SearchConfig::default().with_splits(3, 1.0, 1);
        assert!(bad.validate().unwrap_err().is_configuration());
        let bad = SearchConfig::default().with_processes(0, 30);
        assert!(bad.validate().unwrap_err().is_configuration());
        let mut bad = SearchConfig::default();
        bad.alpha_low = 0.0;
        assert!(bad.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn study_config_carries_search_settings() {
        let config = SearchConfig::default().with_sampler(SamplerConfig::Random { seed: 5 });
        let study = config.study_config(StudyKind::ClosedLoop);
        assert_eq!(study.name, "closed_loop");
        assert_eq!(study.sampler, SamplerConfig::Random { seed: 5 });
        assert!(study.search_space.get(ALPHA).is_ok());
    }
}
