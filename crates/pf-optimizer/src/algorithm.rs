//! The contract between the scheduling loop and an optimization strategy.

use pf_types::{
    AlgorithmConfig, EvaluationJob, EvaluationResult, FitConfig, JobFactory, ParameterSet,
    PfResult, Trajectory,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::ant_colony::AntColony;
use crate::space::ParameterSpace;
use crate::swarm::ParticleSwarm;

/// What a strategy wants the scheduler to do after a result.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Submit these parameter sets (possibly none).
    Continue(Vec<ParameterSet>),
    /// The stop criterion is met; cancel outstanding work and finish.
    Stop,
}

impl Response {
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

/// State every strategy carries: the parameter space, the trajectory of
/// scored results, and the job factory.
#[derive(Debug)]
pub struct AlgorithmCore {
    pub space: ParameterSpace,
    pub trajectory: Trajectory,
    pub jobs: JobFactory,
}

impl AlgorithmCore {
    pub fn new(space: ParameterSpace, jobs: JobFactory) -> Self {
        Self {
            space,
            trajectory: Trajectory::new(),
            jobs,
        }
    }

    pub fn from_config(config: &FitConfig) -> PfResult<Self> {
        Ok(Self::new(
            ParameterSpace::from_specs(&config.variables)?,
            JobFactory::from_config(config),
        ))
    }
}

/// An optimization strategy driven by the scheduling loop.
///
/// The loop calls `start` once, then `on_result` (or `on_failure`) once per
/// finished job, strictly one at a time.
pub trait Algorithm: Send {
    /// Human-readable strategy name.
    fn name(&self) -> &str;

    fn core(&self) -> &AlgorithmCore;

    fn core_mut(&mut self) -> &mut AlgorithmCore;

    /// The initial batch of parameter sets.
    fn start(&mut self) -> PfResult<Vec<ParameterSet>>;

    /// React to a scored result.
    fn on_result(&mut self, result: &EvaluationResult) -> PfResult<Response>;

    /// React to a parameter set whose evaluation failed for good. Strategies
    /// treat it as scoring `+inf`.
    fn on_failure(&mut self, params: &ParameterSet) -> PfResult<Response>;

    /// Best parameter set seen by the strategy and its score.
    fn best(&self) -> Option<(&ParameterSet, f64)>;

    fn space(&self) -> &ParameterSpace {
        &self.core().space
    }

    fn trajectory(&self) -> &Trajectory {
        &self.core().trajectory
    }

    /// Append a scored result to the trajectory.
    fn record(&mut self, result: &EvaluationResult) -> PfResult<()> {
        let score = result.scored()?;
        self.core_mut().trajectory.add(result.params.clone(), score);
        Ok(())
    }

    fn make_job(&mut self, params: ParameterSet) -> EvaluationJob {
        self.core_mut().jobs.make_job(params)
    }
}

/// Build the strategy named by `config.algorithm`.
pub fn build_algorithm(config: &FitConfig) -> PfResult<Box<dyn Algorithm>> {
    config.validate()?;
    let algorithm: Box<dyn Algorithm> = match &config.algorithm {
        AlgorithmConfig::ParticleSwarm(swarm) => Box::new(ParticleSwarm::new(
            AlgorithmCore::from_config(config)?,
            swarm.clone(),
            config.seed,
        )?),
        AlgorithmConfig::AntColony(aco) => Box::new(AntColony::new(
            AlgorithmCore::from_config(config)?,
            aco.clone(),
            config.seed,
        )?),
    };
    info!(
        run = %config.id,
        algorithm = algorithm.name(),
        variables = config.variables.len(),
        "initializing algorithm"
    );
    Ok(algorithm)
}

pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Counts "unproductive" generations: ones whose best-score improvement was
/// below `abs_tol + rel_tol * previous_best`.
#[derive(Debug, Clone)]
pub struct StagnationTracker {
    last_best: f64,
    unproductive: usize,
    abs_tol: f64,
    rel_tol: f64,
}

impl StagnationTracker {
    pub fn new(abs_tol: f64, rel_tol: f64) -> Self {
        Self {
            last_best: f64::INFINITY,
            unproductive: 0,
            abs_tol,
            rel_tol,
        }
    }

    /// Close a generation whose best score is `current_best`.
    pub fn end_generation(&mut self, current_best: f64) {
        if self.last_best.is_finite()
            && (self.last_best - current_best).abs() < self.abs_tol + self.rel_tol * self.last_best
        {
            self.unproductive += 1;
            debug!(
                unproductive = self.unproductive,
                best = current_best,
                "unproductive generation"
            );
        }
        self.last_best = current_best;
    }

    pub fn unproductive(&self) -> usize {
        self.unproductive
    }

    pub fn last_best(&self) -> f64 {
        self.last_best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_types::{AntColonyConfig, SwarmConfig, VariableSpec};

    fn config(algorithm: AlgorithmConfig) -> FitConfig {
        FitConfig::new(
            "factory",
            vec![VariableSpec::uniform("x", 0.0, 10.0)],
            algorithm,
        )
        .with_seed(1)
    }

    #[test]
    fn factory_builds_named_strategies() {
        let pso = build_algorithm(&config(AlgorithmConfig::ParticleSwarm(SwarmConfig::new(4, 2)))).unwrap();
        assert_eq!(pso.name(), "particle_swarm");
        assert_eq!(pso.space().len(), 1);

        let aco = build_algorithm(&config(AlgorithmConfig::AntColony(AntColonyConfig::new(10, 2)))).unwrap();
        assert_eq!(aco.name(), "ant_colony");
        assert!(aco.trajectory().is_empty());
    }

    #[test]
    fn factory_rejects_invalid_config() {
        let bad = config(AlgorithmConfig::ParticleSwarm(SwarmConfig::new(0, 2)));
        assert!(build_algorithm(&bad).is_err());
    }

    #[test]
    fn record_requires_a_score() {
        let mut algo = build_algorithm(&config(AlgorithmConfig::ParticleSwarm(SwarmConfig::new(2, 2)))).unwrap();
        let params = ParameterSet::from_pairs([("x", 1.0)]);
        let mut result = EvaluationResult::new(1, params, Default::default(), vec![]);
        assert!(algo.record(&result).is_err());
        result.set_score(4.0).unwrap();
        algo.record(&result).unwrap();
        assert_eq!(algo.trajectory().len(), 1);
    }

    #[test]
    fn make_job_numbers_from_one() {
        let mut algo = build_algorithm(&config(AlgorithmConfig::ParticleSwarm(SwarmConfig::new(2, 2)))).unwrap();
        let a = algo.make_job(ParameterSet::from_pairs([("x", 1.0)]));
        let b = algo.make_job(ParameterSet::from_pairs([("x", 2.0)]));
        assert_eq!((a.id, b.id), (1, 2));
    }

    #[test]
    fn stagnation_counts_small_improvements() {
        let mut tracker = StagnationTracker::new(0.1, 0.0);
        tracker.end_generation(f64::INFINITY);
        assert_eq!(tracker.unproductive(), 0);
        tracker.end_generation(10.0);
        // First finite best has nothing to compare against.
        assert_eq!(tracker.unproductive(), 0);
        tracker.end_generation(9.0);
        assert_eq!(tracker.unproductive(), 0);
        tracker.end_generation(8.95);
        assert_eq!(tracker.unproductive(), 1);
        tracker.end_generation(8.95);
        assert_eq!(tracker.unproductive(), 2);
        assert_eq!(tracker.last_best(), 8.95);
    }

    #[test]
    fn relative_tolerance_scales_with_best() {
        let mut tracker = StagnationTracker::new(0.0, 0.01);
        tracker.end_generation(1000.0);
        tracker.end_generation(995.0);
        assert_eq!(tracker.unproductive(), 1);
        tracker.end_generation(900.0);
        assert_eq!(tracker.unproductive(), 1);
    }
}
