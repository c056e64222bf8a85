//! Simulation executor abstraction.
//!
//! The engine never runs simulators itself. An executor turns one
//! [`EvaluationJob`] into simulation output, or reports why it could not.

use async_trait::async_trait;
use pf_types::{
    Evaluation, EvaluationJob, EvaluationResult, FailedEvaluation, SimulationData,
};
use tracing::{debug, warn};

/// Errors surfaced by executors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("simulation failed: {message}")]
    Failed { message: String },
    #[error("simulation timed out after {seconds} s")]
    Timeout { seconds: f64 },
    #[error("simulation IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Result alias for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Parsed output of every model of one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationOutput {
    pub data: SimulationData,
    /// Captured simulator output, one entry per model run.
    pub log: Vec<String>,
}

impl From<SimulationData> for SimulationOutput {
    fn from(data: SimulationData) -> Self {
        Self {
            data,
            log: Vec::new(),
        }
    }
}

/// Materializes and runs the models of a job.
///
/// Implementations may write model files under [`EvaluationJob::sim_dir`]
/// and shell out to a simulator, or compute output in process.
#[async_trait]
pub trait ModelExecutor: Send + Sync + 'static {
    async fn execute(&self, job: &EvaluationJob) -> ExecutorResult<SimulationOutput>;
}

/// Run `job` on `executor`, mapping success to an unscored result and any
/// error to a [`FailedEvaluation`].
pub async fn run_job<E: ModelExecutor + ?Sized>(executor: &E, job: &EvaluationJob) -> Evaluation {
    debug!(job = job.id, attempt = job.attempt, params = %job.params, "running job");
    match executor.execute(job).await {
        Ok(output) => Evaluation::Completed(EvaluationResult::new(
            job.id,
            job.params.clone(),
            output.data,
            output.log,
        )),
        Err(e) => {
            warn!(job = job.id, error = %e, "simulation failed");
            Evaluation::Failed(FailedEvaluation {
                job_id: job.id,
                message: e.to_string(),
            })
        }
    }
}

/// Adapts a synchronous closure into a [`ModelExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&EvaluationJob) -> ExecutorResult<SimulationData> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ModelExecutor for FnExecutor<F>
where
    F: Fn(&EvaluationJob) -> ExecutorResult<SimulationData> + Send + Sync + 'static,
{
    async fn execute(&self, job: &EvaluationJob) -> ExecutorResult<SimulationOutput> {
        (self.f)(job).map(SimulationOutput::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_types::{JobFactory, ParameterSet};

    fn job(x: f64) -> EvaluationJob {
        JobFactory::new(vec![], "out").make_job(ParameterSet::from_pairs([("x", x)]))
    }

    #[tokio::test]
    async fn success_maps_to_unscored_result() {
        let executor = FnExecutor::new(|_job: &EvaluationJob| Ok(SimulationData::new()));
        match run_job(&executor, &job(1.0)).await {
            Evaluation::Completed(result) => {
                assert_eq!(result.job_id, 1);
                assert_eq!(result.params.get("x"), Some(1.0));
                assert!(result.score().is_none());
            }
            Evaluation::Failed(f) => panic!("unexpected failure: {}", f.message),
        }
    }

    #[tokio::test]
    async fn error_maps_to_failed_evaluation() {
        let executor = FnExecutor::new(|_job: &EvaluationJob| Err(ExecutorError::failed("boom")));
        match run_job(&executor, &job(1.0)).await {
            Evaluation::Failed(f) => {
                assert_eq!(f.job_id, 1);
                assert_eq!(f.message, "simulation failed: boom");
            }
            Evaluation::Completed(_) => panic!("expected failure"),
        }
    }
}
