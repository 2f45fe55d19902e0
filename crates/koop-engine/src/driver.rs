//! Search driver: shared feature set, both studies, final evaluation.

use koop_data::{load_lifting_set, save_lifting_set, write_json, ExperimentDataset};
use koop_optimizer::{StorageUrl, Study};
use std::path::Path;
use tracing::info;

use crate::config::{SearchConfig, StudyKind, ALPHA};
use crate::error::{EngineError, EngineResult};
use crate::evaluation::{evaluate, BestAlphas, EvaluationReport};
use crate::orchestrator::{run_workers, WorkerCommand};

/// Persist the feature set every worker lifts with.
pub fn write_lifting(config: &SearchConfig) -> EngineResult<()> {
    save_lifting_set(&config.lifting_path, &config.lifting)?;
    info!(path = %config.lifting_path.display(), steps = config.lifting.steps.len(), "lifting functions written");
    Ok(())
}

/// Wipe and recreate both study databases.
pub fn prepare_studies(config: &SearchConfig) -> EngineResult<()> {
    config.validate()?;
    for kind in StudyKind::ALL {
        let url = config.storage_url(kind);
        let study = Study::create(url.recreate()?, config.study_config(kind))?;
        info!(study = study.name(), storage = %url, "study created");
    }
    Ok(())
}

/// Command line of one worker joining the `kind` study.
pub fn worker_args(config: &SearchConfig, kind: StudyKind, url: &StorageUrl) -> Vec<String> {
    vec![
        config.dataset_path.display().to_string(),
        config.lifting_path.display().to_string(),
        url.to_string(),
        config.n_trials.to_string(),
        config.split_seed.to_string(),
        "--kind".to_string(),
        kind.cli_name().to_string(),
        "--study-name".to_string(),
        kind.as_str().to_string(),
        "--n-splits".to_string(),
        config.n_splits.to_string(),
        "--test-size".to_string(),
        config.test_size.to_string(),
    ]
}

/// Run both studies to completion, one worker pool at a time, and return the
/// best regularization of each.
pub fn run_search(config: &SearchConfig, worker_bin: &Path) -> EngineResult<BestAlphas> {
    prepare_studies(config)?;
    for kind in StudyKind::ALL {
        let url = config.storage_url(kind);
        let command = WorkerCommand::new(worker_bin).args(worker_args(config, kind, &url));
        info!(study = %kind, n_processes = config.n_processes, n_trials = config.n_trials, "launching workers");
        run_workers(&command, config.n_processes)?;
    }
    best_alphas(config)
}

fn best_alpha(config: &SearchConfig, kind: StudyKind) -> EngineResult<f64> {
    let study = Study::load(config.storage_url(kind).open()?, Some(kind.as_str()))?;
    let best = study.best_trial()?;
    let alpha = best
        .params
        .get(ALPHA)
        .copied()
        .ok_or_else(|| EngineError::Config(format!("best {kind} trial has no '{ALPHA}' parameter")))?;
    info!(study = %kind, trial = best.number, alpha, value = ?best.value, "best trial");
    Ok(alpha)
}

pub fn best_alphas(config: &SearchConfig) -> EngineResult<BestAlphas> {
    Ok(BestAlphas {
        closed_loop: best_alpha(config, StudyKind::ClosedLoop)?,
        open_loop: best_alpha(config, StudyKind::OpenLoop)?,
    })
}

/// Evaluate at `alphas` and write the report to `config.report_path`.
pub fn run_evaluation(config: &SearchConfig, alphas: BestAlphas) -> EngineResult<EvaluationReport> {
    let dataset = ExperimentDataset::load(&config.dataset_path)?;
    let transfer = ExperimentDataset::load(&config.transfer_dataset_path)?;
    let lifting = load_lifting_set(&config.lifting_path)?;
    let report = evaluate(&dataset, &transfer, &lifting, alphas)?;
    write_json(&config.report_path, &report)?;
    info!(path = %config.report_path.display(), "evaluation report written");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{linear_lifting, synthetic_dataset, training_gains, transfer_gains};
    use koop_data::read_json;
    use koop_optimizer::{TrialOutcome, TrialState};
    use tempfile::TempDir;

    fn config_in(dir: &Path) -> SearchConfig {
        SearchConfig::default()
            .with_dataset(dir.join("training.json"), dir.join("transfer.json"))
            .with_lifting(dir.join("lifting.json"), linear_lifting())
            .with_study_dir(dir.join("studies"))
            .with_report_path(dir.join("report.json"))
            .with_processes(2, 3)
    }

    #[test]
    fn prepared_studies_start_empty() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        prepare_studies(&config).unwrap();

        // Leave a trial behind, then prepare again.
        let study = Study::load(config.storage_url(StudyKind::OpenLoop).open().unwrap(), None).unwrap();
        let number = study.ask().unwrap().number();
        study.tell(number, TrialOutcome::Pruned).unwrap();
        prepare_studies(&config).unwrap();

        for kind in StudyKind::ALL {
            let study = Study::load(config.storage_url(kind).open().unwrap(), Some(kind.as_str())).unwrap();
            assert!(study.trials().unwrap().is_empty());
            assert_eq!(study.config(), &config.study_config(kind));
        }
    }

    #[test]
    fn worker_command_line_names_study_and_kind() {
        let config = SearchConfig::default();
        let url = config.storage_url(StudyKind::OpenLoop);
        let args = worker_args(&config, StudyKind::OpenLoop, &url);
        assert_eq!(args[2], "duckdb://build/studies/open_loop.db");
        assert_eq!(&args[3..5], ["30", "1234"]);
        assert_eq!(&args[5..9], ["--kind", "open-loop", "--study-name", "open_loop"]);
        assert_eq!(&args[9..], ["--n-splits", "3", "--test-size", "0.2"]);
    }

    #[test]
    fn best_alphas_come_from_each_study() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        prepare_studies(&config).unwrap();
        for (kind, score) in [(StudyKind::ClosedLoop, 0.5), (StudyKind::OpenLoop, 0.9)] {
            let study = Study::load(config.storage_url(kind).open().unwrap(), None).unwrap();
            let mut trial = study.ask().unwrap();
            trial.suggest_float(ALPHA).unwrap();
            let number = trial.number();
            assert_eq!(study.tell(number, TrialOutcome::Completed(score)).unwrap(), TrialState::Completed);
        }
        let alphas = best_alphas(&config).unwrap();
        assert!(alphas.closed_loop >= config.alpha_low && alphas.closed_loop <= config.alpha_high);
        assert!(alphas.open_loop >= config.alpha_low && alphas.open_loop <= config.alpha_high);
    }

    #[test]
    fn best_alphas_need_a_completed_trial() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        prepare_studies(&config).unwrap();
        assert!(best_alphas(&config).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn failing_workers_abort_the_search() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let err = run_search(&config, Path::new("false")).unwrap_err();
        match err {
            EngineError::WorkersFailed { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn evaluation_report_is_written() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        synthetic_dataset(&training_gains()).save(&config.dataset_path).unwrap();
        synthetic_dataset(&transfer_gains()).save(&config.transfer_dataset_path).unwrap();
        write_lifting(&config).unwrap();

        let alphas = BestAlphas {
            closed_loop: 1e-9,
            open_loop: 1e-9,
        };
        let report = run_evaluation(&config, alphas).unwrap();
        let stored: EvaluationReport = read_json(&config.report_path).unwrap();
        assert_eq!(stored, report);
    }
}
