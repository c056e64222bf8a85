//! Run configuration: free variables, strategy hyperparameters and output
//! settings. Frozen once a run is constructed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::config_error;
use crate::errors::{ConfigError, PfResult};
use crate::evaluation::ModelRef;

/// Unique fitting run identifier.
pub type RunId = Uuid;

/// How a free variable is initialised. The distribution also fixes the
/// coordinate system the variable moves in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Distribution {
    /// Uniform on [low, high]; moves in linear space.
    Uniform { low: f64, high: f64 },
    /// Uniform in log10 space on [low, high]; moves in log space.
    LogUniform { low: f64, high: f64 },
    /// `10^N(mean, std_dev)` clamped to [low, high]; moves in log space.
    LogNormal {
        mean: f64,
        std_dev: f64,
        low: f64,
        high: f64,
    },
    /// Uniform pick from a fixed candidate list; never moved.
    Choice { values: Vec<f64> },
}

/// A single free variable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub distribution: Distribution,
}

impl VariableSpec {
    pub fn uniform(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            distribution: Distribution::Uniform { low, high },
        }
    }

    pub fn log_uniform(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            distribution: Distribution::LogUniform { low, high },
        }
    }

    pub fn log_normal(name: impl Into<String>, mean: f64, std_dev: f64, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            distribution: Distribution::LogNormal {
                mean,
                std_dev,
                low,
                high,
            },
        }
    }

    pub fn choice(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            distribution: Distribution::Choice { values },
        }
    }

    /// Build a declaration from a `(kind, name, params)` triple as written in
    /// fitting configuration files, e.g. `("loguniform_var", "kon", [0.01, 100])`.
    ///
    /// Log-normal declarations take `[mean, std_dev, low, high]`; the bounds
    /// are mandatory.
    pub fn from_declaration(kind: &str, name: &str, params: &[f64]) -> PfResult<Self> {
        let arity = |expected: usize| -> PfResult<()> {
            if params.len() == expected {
                Ok(())
            } else {
                Err(ConfigError::WrongArity {
                    name: name.to_string(),
                    expected,
                    got: params.len(),
                }
                .into())
            }
        };

        let spec = match kind {
            "uniform_var" | "random_var" => {
                arity(2)?;
                Self::uniform(name, params[0], params[1])
            }
            "loguniform_var" => {
                arity(2)?;
                Self::log_uniform(name, params[0], params[1])
            }
            "lognormal_var" | "lognormrandom_var" => {
                arity(4)?;
                Self::log_normal(name, params[0], params[1], params[2], params[3])
            }
            "static_list_var" => Self::choice(name, params.to_vec()),
            other => {
                return Err(ConfigError::UnknownVariableKind {
                    kind: other.to_string(),
                }
                .into())
            }
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> PfResult<()> {
        let bounds = |low: f64, high: f64, positive: bool| -> PfResult<()> {
            let ordered = low.is_finite() && high.is_finite() && low <= high;
            if !ordered || (positive && low <= 0.0) {
                return Err(ConfigError::InvalidBounds {
                    name: self.name.clone(),
                    low,
                    high,
                }
                .into());
            }
            Ok(())
        };

        match &self.distribution {
            Distribution::Uniform { low, high } => bounds(*low, *high, false),
            Distribution::LogUniform { low, high } => bounds(*low, *high, true),
            Distribution::LogNormal {
                mean,
                std_dev,
                low,
                high,
            } => {
                if !mean.is_finite() || !std_dev.is_finite() || *std_dev < 0.0 {
                    return Err(ConfigError::InvalidVariable {
                        name: self.name.clone(),
                        message: format!("invalid log-normal shape ({mean}, {std_dev})"),
                    }
                    .into());
                }
                bounds(*low, *high, true)
            }
            Distribution::Choice { values } => {
                if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
                    return Err(ConfigError::InvalidVariable {
                        name: self.name.clone(),
                        message: "choice list must be non-empty and finite".to_string(),
                    }
                    .into());
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy hyperparameters
// ---------------------------------------------------------------------------

/// Which strategy drives the run, keyed by `fit_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fit_type")]
pub enum AlgorithmConfig {
    #[serde(rename = "pso")]
    ParticleSwarm(SwarmConfig),
    #[serde(rename = "aco")]
    AntColony(AntColonyConfig),
}

impl AlgorithmConfig {
    pub fn population_size(&self) -> usize {
        match self {
            Self::ParticleSwarm(c) => c.population_size,
            Self::AntColony(c) => c.population_size,
        }
    }

    pub fn validate(&self) -> PfResult<()> {
        match self {
            Self::ParticleSwarm(c) => c.validate(),
            Self::AntColony(c) => c.validate(),
        }
    }
}

/// Particle swarm hyperparameters.
///
/// The adaptive inertia settings follow Moraes et al. (2015): after
/// `adaptive_n_max` unproductive generations the weight is halfway from
/// `particle_weight` to `particle_weight_final`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Number of particles.
    pub population_size: usize,
    /// Evaluation cap is `population_size * max_iterations`.
    pub max_iterations: usize,
    /// Acceleration toward the particle's own best.
    #[serde(default = "default_acceleration")]
    pub cognitive: f64,
    /// Acceleration toward the swarm's best.
    #[serde(default = "default_acceleration")]
    pub social: f64,
    #[serde(default = "default_particle_weight")]
    pub particle_weight: f64,
    /// Defaults to `particle_weight`, which disables adaptation.
    #[serde(default)]
    pub particle_weight_final: Option<f64>,
    #[serde(default = "default_n_max")]
    pub adaptive_n_max: usize,
    /// Stop after this many unproductive generations. `None` never stops early.
    #[serde(default)]
    pub adaptive_n_stop: Option<usize>,
    #[serde(default)]
    pub adaptive_abs_tol: f64,
    #[serde(default)]
    pub adaptive_rel_tol: f64,
}

fn default_acceleration() -> f64 {
    1.5
}

fn default_particle_weight() -> f64 {
    1.0
}

fn default_n_max() -> usize {
    30
}

impl SwarmConfig {
    pub fn new(population_size: usize, max_iterations: usize) -> Self {
        Self {
            population_size,
            max_iterations,
            cognitive: default_acceleration(),
            social: default_acceleration(),
            particle_weight: default_particle_weight(),
            particle_weight_final: None,
            adaptive_n_max: default_n_max(),
            adaptive_n_stop: None,
            adaptive_abs_tol: 0.0,
            adaptive_rel_tol: 0.0,
        }
    }

    pub fn with_acceleration(mut self, cognitive: f64, social: f64) -> Self {
        self.cognitive = cognitive;
        self.social = social;
        self
    }

    pub fn with_inertia(mut self, initial: f64, last: f64, n_max: usize) -> Self {
        self.particle_weight = initial;
        self.particle_weight_final = Some(last);
        self.adaptive_n_max = n_max;
        self
    }

    pub fn with_stagnation(mut self, n_stop: usize, abs_tol: f64, rel_tol: f64) -> Self {
        self.adaptive_n_stop = Some(n_stop);
        self.adaptive_abs_tol = abs_tol;
        self.adaptive_rel_tol = rel_tol;
        self
    }

    pub fn max_evaluations(&self) -> usize {
        self.population_size.saturating_mul(self.max_iterations)
    }

    pub fn weight_final(&self) -> f64 {
        self.particle_weight_final.unwrap_or(self.particle_weight)
    }

    pub fn validate(&self) -> PfResult<()> {
        if self.population_size == 0 {
            return Err(config_error!("population_size", "must be at least 1"));
        }
        if self.max_iterations == 0 {
            return Err(config_error!("max_iterations", "must be at least 1"));
        }
        if self.adaptive_n_max == 0 {
            return Err(config_error!("adaptive_n_max", "must be at least 1"));
        }
        for (key, value) in [
            ("cognitive", self.cognitive),
            ("social", self.social),
            ("particle_weight", self.particle_weight),
            ("particle_weight_final", self.weight_final()),
            ("adaptive_abs_tol", self.adaptive_abs_tol),
            ("adaptive_rel_tol", self.adaptive_rel_tol),
        ] {
            if !value.is_finite() {
                return Err(config_error!(key, "must be finite, got {value}"));
            }
        }
        Ok(())
    }
}

/// Ant colony (archive-based) hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntColonyConfig {
    /// Size of the initial random batch, and of one generation.
    pub population_size: usize,
    /// Evaluation cap is `population_size * max_iterations`.
    pub max_iterations: usize,
    /// Capacity of the solution archive.
    #[serde(default = "default_archive_size")]
    pub archive_size: usize,
    /// Rank-weight spread `q`: small values concentrate sampling on the best
    /// archive entries.
    #[serde(default = "default_search_locality")]
    pub search_locality: f64,
    /// Neighbourhood scale `xi` applied to the mean archive distance.
    #[serde(default = "default_convergence_speed")]
    pub convergence_speed: f64,
    /// Number of new candidates proposed per received result.
    #[serde(default = "default_ants_per_result")]
    pub ants_per_result: usize,
    /// Stop after this many generations without improvement. `None` never
    /// stops early.
    #[serde(default)]
    pub stagnation_stop: Option<usize>,
    #[serde(default)]
    pub stagnation_abs_tol: f64,
    #[serde(default)]
    pub stagnation_rel_tol: f64,
}

fn default_archive_size() -> usize {
    10
}

fn default_search_locality() -> f64 {
    0.1
}

fn default_convergence_speed() -> f64 {
    0.85
}

fn default_ants_per_result() -> usize {
    1
}

impl AntColonyConfig {
    pub fn new(population_size: usize, max_iterations: usize) -> Self {
        Self {
            population_size,
            max_iterations,
            archive_size: default_archive_size(),
            search_locality: default_search_locality(),
            convergence_speed: default_convergence_speed(),
            ants_per_result: default_ants_per_result(),
            stagnation_stop: None,
            stagnation_abs_tol: 0.0,
            stagnation_rel_tol: 0.0,
        }
    }

    pub fn with_archive(mut self, archive_size: usize, search_locality: f64, convergence_speed: f64) -> Self {
        self.archive_size = archive_size;
        self.search_locality = search_locality;
        self.convergence_speed = convergence_speed;
        self
    }

    pub fn with_ants_per_result(mut self, n: usize) -> Self {
        self.ants_per_result = n;
        self
    }

    pub fn with_stagnation(mut self, n_stop: usize, abs_tol: f64, rel_tol: f64) -> Self {
        self.stagnation_stop = Some(n_stop);
        self.stagnation_abs_tol = abs_tol;
        self.stagnation_rel_tol = rel_tol;
        self
    }

    pub fn max_evaluations(&self) -> usize {
        self.population_size.saturating_mul(self.max_iterations)
    }

    pub fn validate(&self) -> PfResult<()> {
        if self.population_size == 0 {
            return Err(config_error!("population_size", "must be at least 1"));
        }
        if self.max_iterations == 0 {
            return Err(config_error!("max_iterations", "must be at least 1"));
        }
        if self.archive_size == 0 {
            return Err(config_error!("archive_size", "must be at least 1"));
        }
        if self.ants_per_result == 0 {
            return Err(config_error!("ants_per_result", "must be at least 1"));
        }
        if !(self.search_locality.is_finite() && self.search_locality > 0.0) {
            return Err(config_error!(
                "search_locality",
                "must be positive, got {}",
                self.search_locality
            ));
        }
        if !(self.convergence_speed.is_finite() && self.convergence_speed > 0.0) {
            return Err(config_error!(
                "convergence_speed",
                "must be positive, got {}",
                self.convergence_speed
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run configuration
// ---------------------------------------------------------------------------

/// Top-level configuration for a fitting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: RunId,
    pub name: String,
    #[serde(default)]
    pub description: String,

    /// Free variables, in declaration order.
    pub variables: Vec<VariableSpec>,

    /// Strategy and its hyperparameters.
    pub algorithm: AlgorithmConfig,

    /// Models every job simulates.
    #[serde(default)]
    pub models: Vec<ModelRef>,

    /// Root for `Simulations/` and `Results/`.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// How many jobs may execute at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Write a trajectory snapshot every this many results (0 disables).
    #[serde(default = "default_output_every")]
    pub output_every: usize,

    /// Keep only the most recent snapshot as `Results/sorted_params.txt`.
    #[serde(default)]
    pub delete_old_files: bool,

    /// Resubmissions of a failed job before the strategy is told.
    #[serde(default = "default_max_job_retries")]
    pub max_job_retries: usize,

    /// Wall-clock limit per job in seconds; a job over the limit fails.
    #[serde(default)]
    pub job_timeout_secs: Option<f64>,

    /// Seed for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("pf_output")
}

fn default_concurrency() -> usize {
    4
}

fn default_output_every() -> usize {
    20
}

fn default_max_job_retries() -> usize {
    1
}

impl FitConfig {
    pub fn new(name: impl Into<String>, variables: Vec<VariableSpec>, algorithm: AlgorithmConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            variables,
            algorithm,
            models: Vec::new(),
            output_dir: default_output_dir(),
            concurrency: default_concurrency(),
            output_every: default_output_every(),
            delete_old_files: false,
            max_job_retries: default_max_job_retries(),
            job_timeout_secs: None,
            seed: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_models(mut self, models: Vec<ModelRef>) -> Self {
        self.models = models;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_output_every(mut self, n: usize) -> Self {
        self.output_every = n;
        self
    }

    pub fn with_delete_old_files(mut self, delete: bool) -> Self {
        self.delete_old_files = delete;
        self
    }

    pub fn with_max_job_retries(mut self, n: usize) -> Self {
        self.max_job_retries = n;
        self
    }

    pub fn with_job_timeout(mut self, seconds: f64) -> Self {
        self.job_timeout_secs = Some(seconds);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(text: &str) -> PfResult<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::InvalidSetting {
            key: "config".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> PfResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> PfResult<()> {
        if self.variables.is_empty() {
            return Err(ConfigError::NoVariables.into());
        }
        let mut seen = HashSet::new();
        for var in &self.variables {
            if !seen.insert(var.name.as_str()) {
                return Err(ConfigError::DuplicateVariable {
                    name: var.name.clone(),
                }
                .into());
            }
            var.validate()?;
        }
        if self.concurrency == 0 {
            return Err(config_error!("concurrency", "must be at least 1"));
        }
        if let Some(secs) = self.job_timeout_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(config_error!("job_timeout_secs", "must be positive, got {secs}"));
            }
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(config_error!("job_timeout_secs", "{secs} is out of range"));
            }
        }
        self.algorithm.validate()
    }

    /// `<output_dir>/Simulations`
    pub fn simulations_dir(&self) -> PathBuf {
        self.output_dir.join("Simulations")
    }

    /// `<output_dir>/Results`
    pub fn results_dir(&self) -> PathBuf {
        self.output_dir.join("Results")
    }
}
