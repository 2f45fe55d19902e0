//! Grouped cross-validation of one regularization value, with pruning at
//! fold boundaries.

use koop_data::ExperimentDataset;
use koop_model::{
    score_trajectory, ClosedLoopPipeline, ClosedLoopRegressor, Edmd, KoopmanPipeline, LiftingSet, PlantModel,
    PlantRegressor,
};
use koop_optimizer::{TrialContext, TrialOutcome};
use koop_types::{config_error, episode_indices, Episode, KoopResult, ValidationConfig};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::{StudyKind, ALPHA};
use crate::error::EngineResult;

/// Train/test partition of episode indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffle-split over groups: every fold draws a fresh permutation of the
/// groups and takes `ceil(test_size * n_groups)` of them for testing.
///
/// Folds depend only on the seed and the groups, so every trial of a study
/// sees the same folds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupShuffleSplit {
    n_splits: usize,
    test_size: f64,
    seed: u64,
}

impl GroupShuffleSplit {
    pub fn new(n_splits: usize, test_size: f64, seed: u64) -> KoopResult<Self> {
        if n_splits == 0 {
            return Err(config_error!("n_splits must be positive"));
        }
        if !(test_size > 0.0 && test_size < 1.0) {
            return Err(config_error!("test_size must lie in (0, 1), got {test_size}"));
        }
        Ok(Self {
            n_splits,
            test_size,
            seed,
        })
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    pub fn split(&self, groups: &[usize]) -> KoopResult<Vec<Fold>> {
        let unique: Vec<usize> = groups.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let n_groups = unique.len();
        let n_test = (self.test_size * n_groups as f64).ceil() as usize;
        let n_train = n_groups.saturating_sub(n_test);
        if n_test == 0 || n_train == 0 {
            return Err(config_error!(
                "cannot split {n_groups} episode(s) with test_size {} into non-empty train and test sets",
                self.test_size
            ));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let folds = (0..self.n_splits)
            .map(|_| {
                let mut permutation = unique.clone();
                permutation.shuffle(&mut rng);
                let mut test = permutation[..n_test].to_vec();
                let mut train = permutation[n_test..].to_vec();
                test.sort_unstable();
                train.sort_unstable();
                Fold { train, test }
            })
            .collect();
        Ok(folds)
    }
}

fn select(episodes: &[Episode], indices: &[usize]) -> Vec<Episode> {
    episodes
        .iter()
        .filter(|ep| indices.contains(&ep.index))
        .cloned()
        .collect()
}

/// Scores one `alpha` on the training episodes of a dataset.
pub struct CrossValidation<'a> {
    dataset: &'a ExperimentDataset,
    lifting: &'a LiftingSet,
    kind: StudyKind,
    folds: Vec<Fold>,
    open_loop: Vec<Episode>,
    closed_loop: Vec<Episode>,
    validation: ValidationConfig,
}

impl<'a> CrossValidation<'a> {
    pub fn new(
        dataset: &'a ExperimentDataset,
        lifting: &'a LiftingSet,
        kind: StudyKind,
        splitter: &GroupShuffleSplit,
    ) -> KoopResult<Self> {
        dataset.validate()?;
        let open_loop = dataset.open_loop.train_episodes()?;
        let closed_loop = dataset.closed_loop.train_episodes()?;
        let folds = splitter.split(&episode_indices(&closed_loop))?;
        Ok(Self {
            dataset,
            lifting,
            kind,
            folds,
            open_loop,
            closed_loop,
            validation: ValidationConfig::new(),
        })
    }

    pub fn folds(&self) -> &[Fold] {
        &self.folds
    }

    fn identify_plant(&self, alpha: f64, fold: &Fold) -> KoopResult<PlantModel> {
        let edmd = Edmd::new(alpha)?;
        match self.kind {
            StudyKind::OpenLoop => {
                let train = select(&self.open_loop, &fold.train);
                let mut pipeline = KoopmanPipeline::new(self.lifting.clone(), PlantRegressor::Edmd(edmd));
                pipeline.fit(&train, self.dataset.open_loop.n_inputs, &self.validation)?;
                Ok(pipeline.plant()?.clone())
            }
            StudyKind::ClosedLoop => {
                let train = select(&self.closed_loop, &fold.train);
                let cl = &self.dataset.closed_loop;
                let mut pipeline = ClosedLoopPipeline::new(
                    self.lifting.clone(),
                    ClosedLoopRegressor::Edmd(edmd),
                    cl.controller.clone(),
                    cl.c_plant.clone(),
                );
                pipeline.fit(&train, cl.n_inputs, &self.validation)?;
                pipeline
                    .plant()
                    .cloned()
                    .ok_or_else(|| koop_types::internal_error!("closed-loop regression produced no plant"))
            }
        }
    }

    /// R² of closed-loop predictions on the fold's test episodes.
    pub fn score_fold(&self, alpha: f64, fold: &Fold) -> KoopResult<f64> {
        let plant = self.identify_plant(alpha, fold)?;

        let cl = &self.dataset.closed_loop;
        let mut model =
            ClosedLoopPipeline::from_plant(self.lifting.clone(), &plant, cl.controller.clone(), cl.c_plant.clone())?;
        model.fit(&select(&self.closed_loop, &fold.train), cl.n_inputs, &self.validation)?;

        let test = select(&self.closed_loop, &fold.test);
        let _relaxed = self.validation.relaxed();
        let predicted = model.predict_trajectory(&test, &self.validation)?;
        score_trajectory(&predicted, &test, model.initial_condition_rows()?)
    }

    /// Objective for one trial: fold scores are reported in order and the
    /// trial stops as soon as the pruner asks.
    pub fn objective(&self, trial: &mut TrialContext<'_>) -> EngineResult<TrialOutcome> {
        let alpha = trial.suggest_float(ALPHA)?;
        let mut total = 0.0;
        for (step, fold) in self.folds.iter().enumerate() {
            let score = self.score_fold(alpha, fold)?;
            debug!(trial = trial.number(), kind = %self.kind, fold = step, alpha, score, "fold scored");
            total += score;
            if trial.report(step, score)?.should_prune() {
                return Ok(TrialOutcome::Pruned);
            }
        }
        Ok(TrialOutcome::Completed(total / self.folds.len() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{linear_lifting, synthetic_dataset, training_gains};
    use koop_optimizer::{
        InMemoryStorage, PrunerConfig, SamplerConfig, SearchSpace, Study, StudyConfig, StudyStorage, TrialState,
    };
    use std::sync::Arc;

    #[test]
    fn grouped_folds_never_share_an_episode() {
        for n_groups in [2usize, 5, 13] {
            // Repeated labels, as a grouped split sees them.
            let groups: Vec<usize> = (0..n_groups).flat_map(|g| [g * 3, g * 3]).collect();
            let all: BTreeSet<usize> = groups.iter().copied().collect();
            for n_splits in [1, 3, 7] {
                for test_size in [0.1, 0.34, 0.5, 0.9] {
                    let splitter = GroupShuffleSplit::new(n_splits, test_size, 1234).unwrap();
                    let n_test = (test_size * n_groups as f64).ceil() as usize;
                    let case = format!("{n_groups} groups, {n_splits} splits, test_size {test_size}");

                    if n_test >= n_groups {
                        let err = splitter.split(&groups).unwrap_err();
                        assert!(err.is_configuration(), "{case}");
                        continue;
                    }
                    let folds = splitter.split(&groups).unwrap();
                    assert_eq!(folds.len(), n_splits, "{case}");
                    for fold in &folds {
                        let train: BTreeSet<usize> = fold.train.iter().copied().collect();
                        let test: BTreeSet<usize> = fold.test.iter().copied().collect();
                        assert_eq!(test.len(), n_test, "{case}");
                        assert_eq!(fold.test.len(), n_test, "{case}");
                        assert!(train.is_disjoint(&test), "{case}");
                        assert_eq!(train.union(&test).copied().collect::<BTreeSet<_>>(), all, "{case}");
                    }
                    // Same seed, same folds.
                    assert_eq!(folds, splitter.split(&groups).unwrap(), "{case}");
                }
            }
        }
    }

    #[test]
    fn impossible_splits_are_configuration_errors() {
        let err = GroupShuffleSplit::new(3, 0.5, 1).unwrap().split(&[7]).unwrap_err();
        assert!(err.is_configuration());
        assert!(GroupShuffleSplit::new(0, 0.2, 1).unwrap_err().is_configuration());
        assert!(GroupShuffleSplit::new(3, 0.0, 1).is_err());
    }

    #[test]
    fn test_size_rounds_up() {
        let folds = GroupShuffleSplit::new(1, 0.2, 3).unwrap().split(&[0, 1, 2, 3]).unwrap();
        assert_eq!(folds[0].test.len(), 1);
        assert_eq!(folds[0].train.len(), 3);
    }

    #[test]
    fn small_alpha_scores_well_for_both_studies() {
        let dataset = synthetic_dataset(&training_gains());
        let lifting = linear_lifting();
        let splitter = GroupShuffleSplit::new(2, 0.25, 1234).unwrap();
        for kind in StudyKind::ALL {
            let cv = CrossValidation::new(&dataset, &lifting, kind, &splitter).unwrap();
            for fold in cv.folds() {
                let score = cv.score_fold(1e-9, fold).unwrap();
                assert!(score > 0.99, "{kind} fold {fold:?} scored {score}");
            }
        }
    }

    #[test]
    fn first_fold_below_threshold_prunes_trial() {
        let dataset = synthetic_dataset(&training_gains());
        let lifting = linear_lifting();
        let splitter = GroupShuffleSplit::new(3, 0.25, 1234).unwrap();
        let cv = CrossValidation::new(&dataset, &lifting, StudyKind::ClosedLoop, &splitter).unwrap();

        // No R² can exceed 1, so every first fold falls below this bound.
        let config = StudyConfig::new("closed_loop", SearchSpace::new().add_log_uniform(ALPHA, 1e-12, 1e-6))
            .with_sampler(SamplerConfig::Random { seed: 1 })
            .with_pruner(PrunerConfig::Threshold {
                lower: Some(2.0),
                upper: None,
                n_warmup_steps: 0,
            });
        let storage: Arc<dyn StudyStorage> = Arc::new(InMemoryStorage::new());
        let study = Study::create(storage, config).unwrap();
        let summary = study.optimize(1, |trial| cv.objective(trial)).unwrap();

        assert_eq!(summary.pruned, 1);
        let trial = &study.trials().unwrap()[0];
        assert_eq!(trial.state, TrialState::Pruned);
        assert_eq!(trial.intermediate_values.keys().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn completed_trial_reports_every_fold() {
        let dataset = synthetic_dataset(&training_gains());
        let lifting = linear_lifting();
        let splitter = GroupShuffleSplit::new(3, 0.25, 1234).unwrap();
        let cv = CrossValidation::new(&dataset, &lifting, StudyKind::OpenLoop, &splitter).unwrap();

        let config = StudyConfig::new("open_loop", SearchSpace::new().add_log_uniform(ALPHA, 1e-12, 1e-8));
        let study = Study::create(Arc::new(InMemoryStorage::new()), config).unwrap();
        let summary = study.optimize(2, |trial| cv.objective(trial)).unwrap();

        assert_eq!(summary.completed, 2);
        for trial in study.trials().unwrap() {
            assert_eq!(trial.intermediate_values.len(), 3);
            let mean = trial.intermediate_values.values().sum::<f64>() / 3.0;
            assert!((trial.value.unwrap() - mean).abs() < 1e-12);
        }
    }
}
