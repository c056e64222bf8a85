//! Evaluation jobs and what comes back from them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::FitConfig;
use crate::errors::{EvaluationError, PfResult};
use crate::params::ParameterSet;

/// Job identifier, monotonically increasing from 1 within a run.
pub type JobId = u64;

/// A model every job simulates. The model text itself is owned by the
/// executor; the core only passes references around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub name: String,
    pub path: PathBuf,
    /// Output suffixes the executor is expected to produce per model.
    #[serde(default)]
    pub suffixes: Vec<String>,
}

impl ModelRef {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            suffixes: Vec::new(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffixes.push(suffix.into());
        self
    }
}

/// A column-oriented block of numeric output, e.g. one time course.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl DataTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<f64>) {
        self.rows.push(row);
    }

    /// All values of one column, if present.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx).copied()).collect())
    }
}

/// Simulation output keyed by model name, then by output suffix.
pub type SimulationData = BTreeMap<String, BTreeMap<String, DataTable>>;

/// One unit of work: simulate every model with one parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationJob {
    pub id: JobId,
    pub params: ParameterSet,
    pub models: Arc<[ModelRef]>,
    /// Parent directory of the per-job simulation folders.
    pub output_dir: PathBuf,
    /// 0 for the first submission, incremented on every retry.
    pub attempt: usize,
}

impl EvaluationJob {
    /// `<output_dir>/sim_<id>`
    pub fn sim_dir(&self) -> PathBuf {
        self.output_dir.join(format!("sim_{}", self.id))
    }

    /// File stem for a model's files within this job, `<model>_<id>`.
    pub fn model_stem(&self, model: &ModelRef) -> String {
        format!("{}_{}", model.name, self.id)
    }
}

/// A successful simulation. The score is filled in by the scheduler before
/// the strategy sees the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub job_id: JobId,
    pub params: ParameterSet,
    pub data: SimulationData,
    /// Captured stdout/stderr, one entry per model.
    pub log: Vec<String>,
    score: Option<f64>,
}

impl EvaluationResult {
    pub fn new(job_id: JobId, params: ParameterSet, data: SimulationData, log: Vec<String>) -> Self {
        Self {
            job_id,
            params,
            data,
            log,
            score: None,
        }
    }

    /// Attach the objective value. A result is scored exactly once.
    pub fn set_score(&mut self, score: f64) -> PfResult<()> {
        if self.score.is_some() {
            return Err(EvaluationError::AlreadyScored {
                job_id: self.job_id,
            }
            .into());
        }
        self.score = Some(score);
        Ok(())
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    /// The score, or an error if the result never went through scoring.
    pub fn scored(&self) -> PfResult<f64> {
        self.score.ok_or_else(|| EvaluationError::Unscored.into())
    }
}

/// Marker for a job whose simulation could not be completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvaluation {
    pub job_id: JobId,
    pub message: String,
}

/// Either outcome of running a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Completed(EvaluationResult),
    Failed(FailedEvaluation),
}

impl Evaluation {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Completed(r) => r.job_id,
            Self::Failed(f) => f.job_id,
        }
    }
}

/// Hands out jobs with increasing ids.
#[derive(Debug, Clone)]
pub struct JobFactory {
    last_id: JobId,
    models: Arc<[ModelRef]>,
    output_dir: PathBuf,
}

impl JobFactory {
    pub fn new(models: Vec<ModelRef>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            last_id: 0,
            models: models.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn from_config(config: &FitConfig) -> Self {
        Self::new(config.models.clone(), config.simulations_dir())
    }

    pub fn make_job(&mut self, params: ParameterSet) -> EvaluationJob {
        self.last_id += 1;
        EvaluationJob {
            id: self.last_id,
            params,
            models: Arc::clone(&self.models),
            output_dir: self.output_dir.clone(),
            attempt: 0,
        }
    }

    /// A fresh job for a failed one, keeping its parameter set.
    pub fn retry_job(&mut self, failed: &EvaluationJob) -> EvaluationJob {
        let mut job = self.make_job(failed.params.clone());
        job.attempt = failed.attempt + 1;
        job
    }

    /// Number of jobs issued so far.
    pub fn issued(&self) -> u64 {
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> JobFactory {
        JobFactory::new(
            vec![ModelRef::new("parabola", "models/parabola.bngl").with_suffix("par1")],
            "out/Simulations",
        )
    }

    #[test]
    fn job_ids_start_at_one_and_increase() {
        let mut jobs = factory();
        let a = jobs.make_job(ParameterSet::from_pairs([("x", 1.0)]));
        let b = jobs.make_job(ParameterSet::from_pairs([("x", 2.0)]));
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(jobs.issued(), 2);
        assert_eq!(a.sim_dir(), PathBuf::from("out/Simulations/sim_1"));
        assert_eq!(b.model_stem(&b.models[0]), "parabola_2");
    }

    #[test]
    fn retry_keeps_params_with_new_id() {
        let mut jobs = factory();
        let first = jobs.make_job(ParameterSet::from_pairs([("x", 1.0)]));
        let retry = jobs.retry_job(&first);
        assert_eq!(retry.id, 2);
        assert_eq!(retry.params, first.params);
        assert_eq!(retry.attempt, 1);
    }

    #[test]
    fn score_is_set_exactly_once() {
        let mut result = EvaluationResult::new(
            4,
            ParameterSet::from_pairs([("x", 1.0)]),
            SimulationData::new(),
            vec![],
        );
        assert!(result.scored().is_err());
        result.set_score(2.5).unwrap();
        assert_eq!(result.score(), Some(2.5));
        let err = result.set_score(1.0).unwrap_err();
        assert!(err.to_string().contains("already scored"));
        assert_eq!(result.scored().unwrap(), 2.5);
    }

    #[test]
    fn data_table_column_lookup() {
        let mut table = DataTable::new(vec!["time".into(), "A".into()]);
        table.push_row(vec![0.0, 3.0]);
        table.push_row(vec![1.0, 2.0]);
        assert_eq!(table.column("A"), Some(vec![3.0, 2.0]));
        assert_eq!(table.column("B"), None);
    }
}
