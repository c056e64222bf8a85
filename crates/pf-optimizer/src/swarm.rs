//! Asynchronous particle swarm search.
//!
//! Each particle is re-proposed as soon as its own result arrives, so there
//! is no generation barrier. A "generation" is counted every
//! `population_size` evaluations and drives the adaptive inertia weight and
//! the stagnation stop.

use pf_types::{
    config_error, AlgorithmError, EvaluationResult, ParameterSet, PfResult, SwarmConfig,
};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::algorithm::{make_rng, Algorithm, AlgorithmCore, Response, StagnationTracker};

/// Upper bound on collision-resolving perturbations for one proposal.
pub const MAX_COLLISION_RETRIES: usize = 1000;

/// Half-width of the uniform nudge applied on a collision.
const COLLISION_NUDGE: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct Particle {
    pub position: ParameterSet,
    /// One component per space entry, in declaration order.
    pub velocity: Vec<f64>,
    pub best: Option<(ParameterSet, f64)>,
}

impl Particle {
    pub fn best_score(&self) -> f64 {
        self.best.as_ref().map_or(f64::INFINITY, |(_, s)| *s)
    }
}

pub struct ParticleSwarm {
    core: AlgorithmCore,
    config: SwarmConfig,
    rng: StdRng,
    particles: Vec<Particle>,
    /// In-flight parameter set -> particle index.
    pending: HashMap<ParameterSet, usize>,
    global_best: Option<(ParameterSet, f64)>,
    stagnation: StagnationTracker,
    evaluations: usize,
}

impl ParticleSwarm {
    pub fn new(core: AlgorithmCore, config: SwarmConfig, seed: Option<u64>) -> PfResult<Self> {
        config.validate()?;
        // Every particle needs its own start position.
        if let Some(points) = core.space.distinct_points() {
            if points < config.population_size {
                return Err(config_error!(
                    "population_size",
                    "{} particles but the space has only {} distinct parameter sets",
                    config.population_size,
                    points
                ));
            }
        }
        let stagnation = StagnationTracker::new(config.adaptive_abs_tol, config.adaptive_rel_tol);
        Ok(Self {
            core,
            particles: Vec::with_capacity(config.population_size),
            pending: HashMap::new(),
            global_best: None,
            stagnation,
            evaluations: 0,
            rng: make_rng(seed),
            config,
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particle(&self, index: usize) -> Option<&Particle> {
        self.particles.get(index)
    }

    pub fn global_best(&self) -> Option<(&ParameterSet, f64)> {
        self.global_best.as_ref().map(|(p, s)| (p, *s))
    }

    pub fn personal_best(&self, index: usize) -> Option<(&ParameterSet, f64)> {
        self.particles
            .get(index)?
            .best
            .as_ref()
            .map(|(p, s)| (p, *s))
    }

    /// Number of parameter sets awaiting a result.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Particle index an in-flight set is registered under.
    pub fn pending_slot(&self, params: &ParameterSet) -> Option<usize> {
        self.pending.get(params).copied()
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn unproductive_generations(&self) -> usize {
        self.stagnation.unproductive()
    }

    /// Current inertia weight `w0 + (wf - w0) * nv / (nv + n_max)`.
    pub fn inertia_weight(&self) -> f64 {
        let nv = self.stagnation.unproductive() as f64;
        let n_max = self.config.adaptive_n_max as f64;
        let w0 = self.config.particle_weight;
        w0 + (self.config.weight_final() - w0) * nv / (nv + n_max)
    }

    fn should_stop(&self) -> bool {
        self.evaluations >= self.config.max_evaluations()
            || self
                .config
                .adaptive_n_stop
                .is_some_and(|n_stop| self.stagnation.unproductive() >= n_stop)
    }

    fn advance(&mut self, params: &ParameterSet, score: f64) -> PfResult<Response> {
        self.evaluations += 1;
        if self.evaluations % self.config.population_size == 0 {
            let current = self.global_best.as_ref().map_or(f64::INFINITY, |(_, s)| *s);
            self.stagnation.end_generation(current);
        }

        let index = self.pending.remove(params).ok_or_else(|| {
            AlgorithmError::UnknownParameterSet {
                params: params.to_string(),
            }
        })?;

        let particle = &mut self.particles[index];
        if score < particle.best_score() {
            particle.best = Some((params.clone(), score));
            let global = self.global_best.as_ref().map_or(f64::INFINITY, |(_, s)| *s);
            if score < global {
                debug!(particle = index, score, "new global best");
                self.global_best = Some((params.clone(), score));
            }
        }

        let w = self.inertia_weight();
        let (c1, c2) = (self.config.cognitive, self.config.social);
        let particle = &mut self.particles[index];
        let space = &self.core.space;
        for (i, entry) in space.entries().iter().enumerate() {
            let name = entry.name.as_str();
            let cognitive = match &particle.best {
                Some((best, _)) => {
                    c1 * self.rng.random::<f64>() * space.difference(best, &particle.position, name)?
                }
                None => 0.0,
            };
            let social = match &self.global_best {
                Some((best, _)) => {
                    c2 * self.rng.random::<f64>() * space.difference(best, &particle.position, name)?
                }
                None => 0.0,
            };
            particle.velocity[i] = w * particle.velocity[i] + cognitive + social;
        }

        let mut next = space.translate(&particle.position, &particle.velocity)?;

        let mut attempts = 0;
        while self.pending.contains_key(&next) {
            attempts += 1;
            if attempts > MAX_COLLISION_RETRIES {
                return Err(AlgorithmError::CollisionRetriesExhausted {
                    attempts: MAX_COLLISION_RETRIES,
                }
                .into());
            }
            let rng = &mut self.rng;
            next = space.step(&next, |_| {
                Ok(rng.random_range(-COLLISION_NUDGE..=COLLISION_NUDGE))
            })?;
        }
        if attempts > 0 {
            debug!(particle = index, attempts, "perturbed colliding parameter set");
        }

        particle.position = next.clone();
        self.pending.insert(next.clone(), index);

        if self.should_stop() {
            info!(
                evaluations = self.evaluations,
                unproductive = self.stagnation.unproductive(),
                best = ?self.global_best.as_ref().map(|(_, s)| *s),
                "particle swarm stopping"
            );
            return Ok(Response::Stop);
        }
        Ok(Response::Continue(vec![next]))
    }
}

impl Algorithm for ParticleSwarm {
    fn name(&self) -> &str {
        "particle_swarm"
    }

    fn core(&self) -> &AlgorithmCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AlgorithmCore {
        &mut self.core
    }

    fn start(&mut self) -> PfResult<Vec<ParameterSet>> {
        self.particles.clear();
        self.pending.clear();
        self.global_best = None;
        self.evaluations = 0;
        self.stagnation =
            StagnationTracker::new(self.config.adaptive_abs_tol, self.config.adaptive_rel_tol);

        let dims = self.core.space.len();
        let mut batch = Vec::with_capacity(self.config.population_size);
        for index in 0..self.config.population_size {
            let mut position = self.core.space.sample(&mut self.rng);
            let mut attempts = 0;
            while self.pending.contains_key(&position) {
                attempts += 1;
                if attempts > MAX_COLLISION_RETRIES {
                    return Err(AlgorithmError::CollisionRetriesExhausted {
                        attempts: MAX_COLLISION_RETRIES,
                    }
                    .into());
                }
                position = self.core.space.sample(&mut self.rng);
            }
            let velocity: Vec<f64> = (0..dims).map(|_| self.rng.random_range(-1.0..=1.0)).collect();
            self.pending.insert(position.clone(), index);
            self.particles.push(Particle {
                position: position.clone(),
                velocity,
                best: None,
            });
            batch.push(position);
        }

        info!(
            particles = batch.len(),
            max_evaluations = self.config.max_evaluations(),
            "particle swarm started"
        );
        Ok(batch)
    }

    fn on_result(&mut self, result: &EvaluationResult) -> PfResult<Response> {
        let score = result.scored()?;
        self.advance(&result.params, score)
    }

    fn on_failure(&mut self, params: &ParameterSet) -> PfResult<Response> {
        warn!(params = %params, "scoring failed evaluation as +inf");
        self.advance(params, f64::INFINITY)
    }

    fn best(&self) -> Option<(&ParameterSet, f64)> {
        self.global_best()
    }
}
