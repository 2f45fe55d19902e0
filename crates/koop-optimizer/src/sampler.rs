//! Parameter samplers.
//!
//! Samplers are stateless between calls: every suggestion is derived from the
//! study history read from storage, so any number of worker processes can
//! share one study. Each (seed, trial number, parameter) triple gets its own
//! random stream.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::search::ParameterDef;
use crate::trial::{FrozenTrial, ObjectiveDirection, TrialState};

pub trait Sampler: Send + Sync {
    /// Suggest a value for `param` in trial `trial_number`.
    fn sample(
        &self,
        param: &ParameterDef,
        trial_number: usize,
        history: &[FrozenTrial],
        direction: ObjectiveDirection,
    ) -> f64;

    fn name(&self) -> &str;
}

/// Serializable sampler choice stored with the study.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerConfig {
    Tpe {
        seed: u64,
        n_startup_trials: usize,
        n_ei_candidates: usize,
    },
    Random {
        seed: u64,
    },
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig::Tpe {
            seed: 3501,
            n_startup_trials: 10,
            n_ei_candidates: 24,
        }
    }
}

impl SamplerConfig {
    pub fn build(&self) -> Box<dyn Sampler> {
        match *self {
            SamplerConfig::Tpe {
                seed,
                n_startup_trials,
                n_ei_candidates,
            } => Box::new(
                TpeSampler::new(seed)
                    .with_startup_trials(n_startup_trials)
                    .with_ei_candidates(n_ei_candidates),
            ),
            SamplerConfig::Random { seed } => Box::new(RandomSampler::new(seed)),
        }
    }
}

fn trial_rng(seed: u64, trial_number: usize, param: &str) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(trial_number as u64));
    // FNV-1a over the parameter name selects the stream.
    let stream = param
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3));
    rng.set_stream(stream);
    rng
}

fn sample_uniform(param: &ParameterDef, rng: &mut ChaCha8Rng) -> f64 {
    let (low, high) = param.kind.internal_bounds();
    if low >= high {
        return param.kind.from_internal(low);
    }
    param.kind.from_internal(rng.gen_range(low..=high))
}

// ---- Random sampler ----

/// Independent uniform sampling (log-uniform where declared).
#[derive(Debug, Clone)]
pub struct RandomSampler {
    seed: u64,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Sampler for RandomSampler {
    fn sample(
        &self,
        param: &ParameterDef,
        trial_number: usize,
        _history: &[FrozenTrial],
        _direction: ObjectiveDirection,
    ) -> f64 {
        let mut rng = trial_rng(self.seed, trial_number, &param.name);
        sample_uniform(param, &mut rng)
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Tree-structured Parzen estimator ----

/// Independent TPE sampler.
///
/// Finished trials are ranked best-first and split into a "good" group of
/// `min(ceil(0.1 n), 25)` trials and the rest. A Parzen estimator is fit to
/// each group and the candidate with the largest `l(x) / g(x)` among
/// `n_ei_candidates` draws from `l` is suggested. Until `n_startup_trials`
/// trials have completed, suggestions are uniform.
#[derive(Debug, Clone)]
pub struct TpeSampler {
    seed: u64,
    n_startup_trials: usize,
    n_ei_candidates: usize,
}

impl TpeSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            n_startup_trials: 10,
            n_ei_candidates: 24,
        }
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn with_ei_candidates(mut self, n: usize) -> Self {
        self.n_ei_candidates = n.max(1);
        self
    }
}

impl Sampler for TpeSampler {
    fn sample(
        &self,
        param: &ParameterDef,
        trial_number: usize,
        history: &[FrozenTrial],
        direction: ObjectiveDirection,
    ) -> f64 {
        let mut rng = trial_rng(self.seed, trial_number, &param.name);
        let (low, high) = param.kind.internal_bounds();
        let n_completed = history
            .iter()
            .filter(|t| t.state == TrialState::Completed && t.params.contains_key(&param.name))
            .count();
        if n_completed < self.n_startup_trials.max(1) || low >= high {
            return sample_uniform(param, &mut rng);
        }

        let (good, bad) = split_observations(param, history, direction);
        let below = ParzenEstimator::new(&good, low, high);
        let above = ParzenEstimator::new(&bad, low, high);

        let best = (0..self.n_ei_candidates)
            .map(|_| below.sample(&mut rng))
            .map(|x| (x, below.log_pdf(x) - above.log_pdf(x)))
            .fold((0.5 * (low + high), f64::NEG_INFINITY), |acc, cand| {
                if cand.1 > acc.1 {
                    cand
                } else {
                    acc
                }
            });
        param.kind.from_internal(best.0)
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

/// Rank finished trials best-first: completed trials by objective, then
/// pruned trials by how far they got and their last reported value.
fn split_observations(
    param: &ParameterDef,
    history: &[FrozenTrial],
    direction: ObjectiveDirection,
) -> (Vec<f64>, Vec<f64>) {
    let worst = match direction {
        ObjectiveDirection::Maximize => f64::NEG_INFINITY,
        ObjectiveDirection::Minimize => f64::INFINITY,
    };
    let usable = |v: f64| if v.is_nan() { worst } else { v };

    let mut ranked: Vec<(&FrozenTrial, f64)> = history
        .iter()
        .filter(|t| matches!(t.state, TrialState::Completed | TrialState::Pruned))
        .filter_map(|t| t.params.get(&param.name).map(|v| (t, param.kind.to_internal(*v))))
        .collect();
    ranked.sort_by(|(a, _), (b, _)| match (a.state, b.state) {
        (TrialState::Completed, TrialState::Completed) => direction.compare(
            usable(a.value.unwrap_or(f64::NAN)),
            usable(b.value.unwrap_or(f64::NAN)),
        ),
        (TrialState::Completed, _) => Ordering::Less,
        (_, TrialState::Completed) => Ordering::Greater,
        _ => {
            let (sa, va) = a.last_step().unwrap_or((0, f64::NAN));
            let (sb, vb) = b.last_step().unwrap_or((0, f64::NAN));
            sb.cmp(&sa).then(direction.compare(usable(va), usable(vb)))
        }
    });

    let n = ranked.len();
    let n_good = ((0.1 * n as f64).ceil() as usize).min(25).max(1).min(n);
    let good = ranked[..n_good].iter().map(|(_, x)| *x).collect();
    let bad = ranked[n_good..].iter().map(|(_, x)| *x).collect();
    (good, bad)
}

/// Mixture of normals truncated to `[low, high]`, one per observation plus a
/// broad prior centred on the range.
#[derive(Debug, Clone)]
struct ParzenEstimator {
    mus: Vec<f64>,
    sigmas: Vec<f64>,
    low: f64,
    high: f64,
}

impl ParzenEstimator {
    fn new(observations: &[f64], low: f64, high: f64) -> Self {
        let prior_mu = 0.5 * (low + high);
        let prior_sigma = high - low;

        let mut mus: Vec<f64> = observations.to_vec();
        mus.push(prior_mu);
        let n = mus.len();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| mus[a].partial_cmp(&mus[b]).unwrap_or(Ordering::Equal));

        let min_sigma = prior_sigma / (1.0 + n as f64).min(100.0);
        let mut sigmas = vec![prior_sigma; n];
        for (rank, &i) in order.iter().enumerate() {
            if i == n - 1 {
                continue;
            }
            let left = if rank == 0 { low } else { mus[order[rank - 1]] };
            let right = if rank + 1 == n { high } else { mus[order[rank + 1]] };
            let spread = (mus[i] - left).max(right - mus[i]);
            sigmas[i] = spread.clamp(min_sigma, prior_sigma);
        }

        Self {
            mus,
            sigmas,
            low,
            high,
        }
    }

    fn sample(&self, rng: &mut ChaCha8Rng) -> f64 {
        let k = rng.gen_range(0..self.mus.len());
        let (mu, sigma) = (self.mus[k], self.sigmas[k]);
        for _ in 0..100 {
            let x = mu + sigma * standard_normal(rng);
            if x >= self.low && x <= self.high {
                return x;
            }
        }
        mu.clamp(self.low, self.high)
    }

    fn log_pdf(&self, x: f64) -> f64 {
        let weight = (self.mus.len() as f64).recip().ln();
        let terms: Vec<f64> = self
            .mus
            .iter()
            .zip(&self.sigmas)
            .map(|(&mu, &sigma)| {
                let z = (x - mu) / sigma;
                let mass = normal_cdf((self.high - mu) / sigma) - normal_cdf((self.low - mu) / sigma);
                weight - 0.5 * z * z - sigma.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln() - mass.max(1e-300).ln()
            })
            .collect();
        log_sum_exp(&terms)
    }
}

/// Box-Muller transform.
fn standard_normal(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz & Stegun 7.1.26.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

fn log_sum_exp(terms: &[f64]) -> f64 {
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchSpace;

    fn completed(number: usize, name: &str, x: f64, value: f64) -> FrozenTrial {
        let mut t = FrozenTrial::new(number, None);
        t.params.insert(name.to_string(), x);
        t.mark_completed(value).unwrap();
        t
    }

    #[test]
    fn random_sampler_is_seeded_per_trial() {
        let space = SearchSpace::new().add_log_uniform("alpha", 1e-12, 1e12);
        let param = space.get("alpha").unwrap();
        let sampler = RandomSampler::new(7);
        let a = sampler.sample(param, 3, &[], ObjectiveDirection::Maximize);
        let b = sampler.sample(param, 3, &[], ObjectiveDirection::Maximize);
        let c = sampler.sample(param, 4, &[], ObjectiveDirection::Maximize);
        assert_eq!(a, b);
        assert_ne!(a, c);
        for n in 0..200 {
            let v = sampler.sample(param, n, &[], ObjectiveDirection::Maximize);
            assert!((1e-12..=1e12).contains(&v), "alpha out of bounds: {v}");
        }
    }

    #[test]
    fn tpe_uses_uniform_startup() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        let param = space.get("x").unwrap();
        let tpe = TpeSampler::new(3501);
        let random = RandomSampler::new(3501);
        let history: Vec<FrozenTrial> = (0..5).map(|n| completed(n, "x", 0.1 * n as f64, 1.0)).collect();
        assert_eq!(
            tpe.sample(param, 5, &history, ObjectiveDirection::Maximize),
            random.sample(param, 5, &history, ObjectiveDirection::Maximize)
        );
    }

    #[test]
    fn tpe_concentrates_near_good_region() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        let param = space.get("x").unwrap();
        let history: Vec<FrozenTrial> = (0..30)
            .map(|n| {
                let x = n as f64 / 29.0;
                completed(n, "x", x, -(x - 0.7).powi(2))
            })
            .collect();

        let tpe = TpeSampler::new(3501);
        let suggestions: Vec<f64> = (30..60)
            .map(|n| tpe.sample(param, n, &history, ObjectiveDirection::Maximize))
            .collect();
        let mean_distance = suggestions.iter().map(|x| (x - 0.7).abs()).sum::<f64>() / suggestions.len() as f64;
        // Uniform sampling would average about 0.29.
        assert!(mean_distance < 0.15, "mean distance {mean_distance}");
        assert!(suggestions.iter().all(|x| (0.0..=1.0).contains(x)));
    }

    #[test]
    fn tpe_is_deterministic_for_same_history() {
        let space = SearchSpace::new().add_log_uniform("alpha", 1e-12, 1e12);
        let param = space.get("alpha").unwrap();
        let history: Vec<FrozenTrial> = (0..15)
            .map(|n| completed(n, "alpha", 10f64.powi(n as i32 - 7), n as f64))
            .collect();
        let tpe = TpeSampler::new(11);
        let a = tpe.sample(param, 15, &history, ObjectiveDirection::Minimize);
        let b = tpe.sample(param, 15, &history, ObjectiveDirection::Minimize);
        assert_eq!(a, b);
        assert!((1e-12..=1e12).contains(&a));
    }

    #[test]
    fn pruned_trials_rank_below_completed() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        let param = space.get("x").unwrap();
        let mut history: Vec<FrozenTrial> = (0..9).map(|n| completed(n, "x", 0.1 * n as f64, -(n as f64))).collect();
        // A pruned trial with a large intermediate value must not look best.
        let mut pruned = FrozenTrial::new(9, None);
        pruned.params.insert("x".into(), 0.95);
        pruned.intermediate_values.insert(0, 100.0);
        pruned.mark_pruned().unwrap();
        history.push(pruned);
        let mut running = FrozenTrial::new(10, None);
        running.params.insert("x".into(), 0.5);
        history.push(running);

        let (good, bad) = split_observations(param, &history, ObjectiveDirection::Maximize);
        assert_eq!(good, vec![0.0]);
        assert_eq!(bad.len(), 9);
        assert_eq!(*bad.last().unwrap(), 0.95);
    }

    #[test]
    fn parzen_density_peaks_at_observations() {
        let parzen = ParzenEstimator::new(&[0.2, 0.25], 0.0, 1.0);
        assert!(parzen.log_pdf(0.22) > parzen.log_pdf(0.9));
        assert!((erf(0.5) - 0.520_499_877_8).abs() < 1e-6);
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn config_round_trips_and_builds() {
        let config = SamplerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kind\":\"tpe\""));
        let back: SamplerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.build().name(), "tpe");
        assert_eq!(SamplerConfig::Random { seed: 1 }.build().name(), "random");
    }
}
