//! Archive-based ant colony search for continuous domains (ACO-R).
//!
//! A bounded archive keeps the best parameter sets seen so far, sorted by
//! score. Each new candidate picks an archive entry with a rank-based
//! Gaussian weight and samples around it, using the mean distance to the
//! other entries as the per-variable step scale.

use pf_types::{AntColonyConfig, EvaluationResult, ParameterSet, PfResult};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use tracing::{debug, info, warn};

use crate::algorithm::{make_rng, Algorithm, AlgorithmCore, Response, StagnationTracker};

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub params: ParameterSet,
    pub score: f64,
}

pub struct AntColony {
    core: AlgorithmCore,
    config: AntColonyConfig,
    rng: StdRng,
    /// Ascending by score; ties keep insertion order.
    archive: Vec<ArchiveEntry>,
    /// Selection probability per archive rank.
    probabilities: Vec<f64>,
    stagnation: StagnationTracker,
    evaluations: usize,
}

impl AntColony {
    pub fn new(core: AlgorithmCore, config: AntColonyConfig, seed: Option<u64>) -> PfResult<Self> {
        config.validate()?;
        let stagnation =
            StagnationTracker::new(config.stagnation_abs_tol, config.stagnation_rel_tol);
        Ok(Self {
            core,
            archive: Vec::with_capacity(config.archive_size + 1),
            probabilities: Vec::new(),
            stagnation,
            evaluations: 0,
            rng: make_rng(seed),
            config,
        })
    }

    pub fn config(&self) -> &AntColonyConfig {
        &self.config
    }

    pub fn archive(&self) -> &[ArchiveEntry] {
        &self.archive
    }

    /// Selection probabilities aligned with `archive()`.
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn unproductive_generations(&self) -> usize {
        self.stagnation.unproductive()
    }

    fn insert(&mut self, params: &ParameterSet, score: f64) {
        if !score.is_finite() {
            debug!(score, "not archiving non-finite score");
            return;
        }
        let rank = self.archive.partition_point(|e| e.score <= score);
        if rank >= self.config.archive_size {
            return;
        }
        self.archive.insert(
            rank,
            ArchiveEntry {
                params: params.clone(),
                score,
            },
        );
        self.archive.truncate(self.config.archive_size);
        self.update_probabilities();
    }

    /// Gaussian rank weights `exp(-l^2 / (2 q^2 k^2)) / (q k sqrt(2 pi))`,
    /// normalised to sum to one.
    fn update_probabilities(&mut self) {
        let k = self.archive.len() as f64;
        let q = self.config.search_locality;
        let spread = q * k;
        let mut weights: Vec<f64> = (0..self.archive.len())
            .map(|l| {
                let l = l as f64;
                (-(l * l) / (2.0 * spread * spread)).exp() / (spread * (2.0 * PI).sqrt())
            })
            .collect();
        let total: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= total;
        }
        self.probabilities = weights;
    }

    fn select(&mut self) -> usize {
        let draw = self.rng.random::<f64>();
        let mut cumulative = 0.0;
        for (index, p) in self.probabilities.iter().enumerate() {
            cumulative += p;
            if draw < cumulative {
                return index;
            }
        }
        self.probabilities.len().saturating_sub(1)
    }

    /// One new candidate: random while the archive is too small to measure
    /// spread, otherwise a Gaussian step around a selected entry.
    fn new_ant(&mut self) -> PfResult<ParameterSet> {
        if self.archive.len() < 2 {
            return Ok(self.core.space.sample(&mut self.rng));
        }

        let seed = self.select();
        let base = &self.archive[seed].params;
        let space = &self.core.space;
        let xi = self.config.convergence_speed;
        let others = (self.archive.len() - 1) as f64;

        let mut deltas = Vec::with_capacity(space.len());
        for entry in space.entries() {
            let mut spread = 0.0;
            for other in &self.archive {
                spread += space.difference(&other.params, base, &entry.name)?.abs();
            }
            let sigma = xi * spread / others;
            deltas.push(sigma * self.rng.sample::<f64, _>(StandardNormal));
        }
        space.translate(base, &deltas)
    }

    fn after_evaluation(&mut self) -> PfResult<Response> {
        self.evaluations += 1;
        if self.evaluations % self.config.population_size == 0 {
            let current = self.archive.first().map_or(f64::INFINITY, |e| e.score);
            self.stagnation.end_generation(current);
        }

        let stagnated = self
            .config
            .stagnation_stop
            .is_some_and(|n| self.stagnation.unproductive() >= n);
        if self.evaluations >= self.config.max_evaluations() || stagnated {
            info!(
                evaluations = self.evaluations,
                unproductive = self.stagnation.unproductive(),
                best = ?self.archive.first().map(|e| e.score),
                "ant colony stopping"
            );
            return Ok(Response::Stop);
        }

        let batch = (0..self.config.ants_per_result)
            .map(|_| self.new_ant())
            .collect::<PfResult<Vec<_>>>()?;
        Ok(Response::Continue(batch))
    }
}

impl Algorithm for AntColony {
    fn name(&self) -> &str {
        "ant_colony"
    }

    fn core(&self) -> &AlgorithmCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AlgorithmCore {
        &mut self.core
    }

    fn start(&mut self) -> PfResult<Vec<ParameterSet>> {
        self.archive.clear();
        self.probabilities.clear();
        self.evaluations = 0;
        self.stagnation =
            StagnationTracker::new(self.config.stagnation_abs_tol, self.config.stagnation_rel_tol);

        let batch: Vec<ParameterSet> = (0..self.config.population_size)
            .map(|_| self.core.space.sample(&mut self.rng))
            .collect();
        info!(
            ants = batch.len(),
            archive_size = self.config.archive_size,
            max_evaluations = self.config.max_evaluations(),
            "ant colony started"
        );
        Ok(batch)
    }

    fn on_result(&mut self, result: &EvaluationResult) -> PfResult<Response> {
        let score = result.scored()?;
        self.insert(&result.params, score);
        self.after_evaluation()
    }

    fn on_failure(&mut self, params: &ParameterSet) -> PfResult<Response> {
        warn!(params = %params, "scoring failed evaluation as +inf");
        self.after_evaluation()
    }

    fn best(&self) -> Option<(&ParameterSet, f64)> {
        self.archive.first().map(|e| (&e.params, e.score))
    }
}
