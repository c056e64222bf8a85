//! Execution pools: where jobs actually run.

use async_trait::async_trait;
use pf_types::{
    config_error, Evaluation, EvaluationJob, FailedEvaluation, FitConfig, JobId, PfResult,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::executor::{run_job, ExecutorError, ModelExecutor};

/// Runs submitted jobs and reports completions in completion order.
#[async_trait]
pub trait ExecutionPool: Send {
    /// Start running `job`. Never blocks.
    fn submit(&mut self, job: EvaluationJob);

    /// Wait for any outstanding job to finish. `None` when nothing is
    /// outstanding.
    async fn next_completed(&mut self) -> Option<Evaluation>;

    /// Best-effort cancellation of one job. Returns whether it was
    /// outstanding.
    fn cancel(&mut self, job_id: JobId) -> bool;

    /// Best-effort cancellation of every outstanding job. Returns how many
    /// were outstanding.
    fn cancel_all(&mut self) -> usize;

    /// Wait for cancelled jobs to wind down and return completions that
    /// finished before cancellation took effect.
    async fn drain(&mut self) -> Vec<Evaluation>;

    /// Number of jobs submitted and not yet reported or cancelled.
    fn outstanding(&self) -> usize;
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// In-process pool of tokio tasks, at most `concurrency` executing at once.
pub struct LocalPool<E: ModelExecutor> {
    executor: Arc<E>,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<Evaluation>,
    rx: mpsc::UnboundedReceiver<Evaluation>,
    running: HashMap<JobId, JoinHandle<()>>,
    cancelled: Vec<JoinHandle<()>>,
    /// Completions of cancelled jobs, handed out by `drain`.
    late: Vec<Evaluation>,
}

impl<E: ModelExecutor> LocalPool<E> {
    pub fn new(executor: E, concurrency: usize) -> Self {
        Self::with_shared(Arc::new(executor), concurrency)
    }

    pub fn with_shared(executor: Arc<E>, concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            executor,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout: None,
            tx,
            rx,
            running: HashMap::new(),
            cancelled: Vec::new(),
            late: Vec::new(),
        }
    }

    /// Pool sized and limited by a run configuration.
    pub fn from_config(executor: E, config: &FitConfig) -> PfResult<Self> {
        let pool = Self::new(executor, config.concurrency);
        let Some(secs) = config.job_timeout_secs else {
            return Ok(pool);
        };
        let timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
            config_error!("job_timeout_secs", "cannot use {} as a timeout: {}", secs, e)
        })?;
        Ok(pool.with_timeout(timeout))
    }

    /// Fail jobs that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

async fn run_limited<E: ModelExecutor + ?Sized>(
    executor: &E,
    job: &EvaluationJob,
    timeout: Option<Duration>,
) -> Evaluation {
    let Some(limit) = timeout else {
        return run_job(executor, job).await;
    };
    match tokio::time::timeout(limit, run_job(executor, job)).await {
        Ok(evaluation) => evaluation,
        Err(_) => {
            warn!(job = job.id, limit_secs = limit.as_secs_f64(), "simulation timed out");
            Evaluation::Failed(FailedEvaluation {
                job_id: job.id,
                message: ExecutorError::Timeout {
                    seconds: limit.as_secs_f64(),
                }
                .to_string(),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[async_trait]
impl<E: ModelExecutor> ExecutionPool for LocalPool<E> {
    fn submit(&mut self, job: EvaluationJob) {
        let executor = Arc::clone(&self.executor);
        let permits = Arc::clone(&self.permits);
        let tx = self.tx.clone();
        let timeout = self.timeout;
        let job_id = job.id;

        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            // The job runs in its own task so a panic surfaces as a JoinError.
            let worker =
                tokio::spawn(async move { run_limited(executor.as_ref(), &job, timeout).await });
            let _abort = AbortOnDrop(worker.abort_handle());
            let evaluation = match worker.await {
                Ok(evaluation) => evaluation,
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic().as_ref());
                    warn!(job = job_id, panic = %message, "simulation task panicked");
                    Evaluation::Failed(FailedEvaluation {
                        job_id,
                        message: format!("simulation task panicked: {message}"),
                    })
                }
                Err(_) => return,
            };
            let _ = tx.send(evaluation);
        });

        debug!(job = job_id, "job submitted to local pool");
        self.running.insert(job_id, handle);
    }

    async fn next_completed(&mut self) -> Option<Evaluation> {
        while !self.running.is_empty() {
            let evaluation = self.rx.recv().await?;
            if self.running.remove(&evaluation.job_id()).is_some() {
                return Some(evaluation);
            }
            debug!(job = evaluation.job_id(), "completion of cancelled job held for drain");
            self.late.push(evaluation);
        }
        None
    }

    fn cancel(&mut self, job_id: JobId) -> bool {
        match self.running.remove(&job_id) {
            Some(handle) => {
                handle.abort();
                self.cancelled.push(handle);
                true
            }
            None => false,
        }
    }

    fn cancel_all(&mut self) -> usize {
        let count = self.running.len();
        for (_, handle) in self.running.drain() {
            handle.abort();
            self.cancelled.push(handle);
        }
        count
    }

    async fn drain(&mut self) -> Vec<Evaluation> {
        for handle in self.cancelled.drain(..) {
            // Cancelled and panicked joins are expected here.
            let _ = handle.await;
        }
        let mut late = std::mem::take(&mut self.late);
        let mut still_running = Vec::new();
        while let Ok(evaluation) = self.rx.try_recv() {
            if self.running.contains_key(&evaluation.job_id()) {
                still_running.push(evaluation);
            } else {
                late.push(evaluation);
            }
        }
        // Completions of jobs that were never cancelled go back in line.
        for evaluation in still_running {
            let _ = self.tx.send(evaluation);
        }
        late
    }

    fn outstanding(&self) -> usize {
        self.running.len()
    }
}
