//! The scheduling loop: submit, wait for any completion, score, update the
//! strategy, resubmit.
//!
//! Strategy state is only touched from this loop, one completion at a time.
//! Jobs run concurrently in the [`ExecutionPool`].

use chrono::Utc;
use crossbeam_channel::Sender;
use pf_optimizer::{build_algorithm, Algorithm, Response};
use pf_types::{
    internal_error, Evaluation, EvaluationError, EvaluationJob, EvaluationResult,
    FailedEvaluation, FitConfig, JobId, ParameterSet, PfResult, SimulationData,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::events::{FitEvent, FitSummary, StopReason};
use crate::executor::ModelExecutor;
use crate::objective::Objective;
use crate::output::ResultsWriter;
use crate::pool::{ExecutionPool, LocalPool};

#[derive(Debug, Default, Clone, Copy)]
struct RunStats {
    evaluations: usize,
    failures: usize,
    retries: usize,
}

/// Drives an [`Algorithm`] against an [`ExecutionPool`].
pub struct FitRunner<P: ExecutionPool> {
    config: FitConfig,
    algorithm: Box<dyn Algorithm>,
    pool: P,
    objective: Arc<dyn Objective>,
    experimental: SimulationData,
    writer: ResultsWriter,
    events: Option<Sender<FitEvent>>,
    /// Submitted and not yet completed.
    outstanding: HashMap<JobId, EvaluationJob>,
    stats: RunStats,
}

impl<E: ModelExecutor> FitRunner<LocalPool<E>> {
    /// Runner with the configured strategy and an in-process pool.
    pub fn local<O: Objective + 'static>(
        config: FitConfig,
        executor: E,
        objective: O,
        experimental: SimulationData,
    ) -> PfResult<Self> {
        let algorithm = build_algorithm(&config)?;
        let pool = LocalPool::from_config(executor, &config)?;
        Ok(Self::new(config, algorithm, pool, objective, experimental))
    }
}

impl<P: ExecutionPool> FitRunner<P> {
    pub fn new<O: Objective + 'static>(
        config: FitConfig,
        algorithm: Box<dyn Algorithm>,
        pool: P,
        objective: O,
        experimental: SimulationData,
    ) -> Self {
        Self {
            writer: ResultsWriter::from_config(&config),
            config,
            algorithm,
            pool,
            objective: Arc::new(objective),
            experimental,
            events: None,
            outstanding: HashMap::new(),
            stats: RunStats::default(),
        }
    }

    /// Emit [`FitEvent`]s on `tx` while running.
    pub fn with_events(mut self, tx: Sender<FitEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn algorithm(&self) -> &dyn Algorithm {
        self.algorithm.as_ref()
    }

    /// Jobs submitted and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Run to completion: until the strategy stops, or no work remains.
    ///
    /// Outstanding jobs are cancelled on the way out, completions that beat
    /// the cancellation are recorded, and a `final` snapshot is written.
    pub async fn run(&mut self) -> PfResult<FitSummary> {
        let started_at = Utc::now();
        self.stats = RunStats::default();
        info!(
            run = %self.config.id,
            name = %self.config.name,
            algorithm = self.algorithm.name(),
            concurrency = self.config.concurrency,
            "fit started"
        );
        self.emit(FitEvent::Started {
            run_id: self.config.id,
            algorithm: self.algorithm.name().to_string(),
        });

        let outcome = self.drive().await;

        let cancelled = self.pool.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "pending jobs cancelled");
        }
        let drained = self.record_late().await;
        self.outstanding.clear();
        let reason = outcome?;

        let trajectory = self.algorithm.trajectory();
        let final_snapshot = self.writer.write_named(trajectory, "final")?;
        self.emit(FitEvent::SnapshotWritten {
            path: final_snapshot.clone(),
            entries: trajectory.len(),
        });

        let (best, best_score) = match trajectory.best() {
            Some(entry) => (Some(entry.params.clone()), Some(entry.score)),
            None => (None, None),
        };
        self.emit(FitEvent::Stopped {
            run_id: self.config.id,
            reason,
            evaluations: self.stats.evaluations,
        });
        info!(
            run = %self.config.id,
            reason = ?reason,
            evaluations = self.stats.evaluations,
            failures = self.stats.failures,
            best = ?best_score,
            "fit complete"
        );

        Ok(FitSummary {
            run_id: self.config.id,
            algorithm: self.algorithm.name().to_string(),
            reason,
            evaluations: self.stats.evaluations,
            failures: self.stats.failures,
            retries: self.stats.retries,
            cancelled,
            drained,
            best,
            best_score,
            final_snapshot,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn drive(&mut self) -> PfResult<StopReason> {
        for params in self.algorithm.start()? {
            self.submit(params);
        }

        loop {
            let Some(evaluation) = self.pool.next_completed().await else {
                warn!(run = %self.config.id, "no outstanding work; stopping");
                return Ok(StopReason::Idle);
            };
            let job_id = evaluation.job_id();
            let job = self
                .outstanding
                .remove(&job_id)
                .ok_or_else(|| internal_error!("completion for unknown job {job_id}"))?;

            let response = match evaluation {
                Evaluation::Completed(result) => self.handle_result(result)?,
                Evaluation::Failed(failed) => match self.handle_failure(&job, failed)? {
                    Some(response) => response,
                    None => continue,
                },
            };

            match response {
                Response::Stop => {
                    info!(evaluations = self.stats.evaluations, "stop criterion satisfied");
                    return Ok(StopReason::Criterion);
                }
                Response::Continue(next) => {
                    for params in next {
                        self.submit(params);
                    }
                }
            }
        }
    }

    fn submit(&mut self, params: ParameterSet) {
        let job = self.algorithm.make_job(params);
        self.dispatch(job);
    }

    fn dispatch(&mut self, job: EvaluationJob) {
        self.emit(FitEvent::JobSubmitted {
            job_id: job.id,
            attempt: job.attempt,
        });
        self.outstanding.insert(job.id, job.clone());
        self.pool.submit(job);
    }

    /// Score via the objective. A non-finite score is an error, so it never
    /// reaches the strategy or the trajectory.
    fn score(&self, result: &mut EvaluationResult) -> PfResult<f64> {
        let score = self.objective.evaluate(&result.data, &self.experimental)?;
        if !score.is_finite() {
            return Err(EvaluationError::NonFiniteScore {
                job_id: result.job_id,
                score,
            }
            .into());
        }
        result.set_score(score)?;
        Ok(score)
    }

    fn handle_result(&mut self, mut result: EvaluationResult) -> PfResult<Response> {
        self.stats.evaluations += 1;
        match self.score(&mut result) {
            Ok(score) => {
                self.algorithm.record(&result)?;
                debug!(job = result.job_id, score, "result recorded");
                self.emit(FitEvent::JobCompleted {
                    job_id: result.job_id,
                    score,
                });
                self.maybe_snapshot()?;
                self.algorithm.on_result(&result)
            }
            Err(e) => {
                self.stats.failures += 1;
                warn!(job = result.job_id, error = %e, "could not score result");
                self.emit(FitEvent::JobFailed {
                    job_id: result.job_id,
                    message: e.to_string(),
                });
                self.algorithm.on_failure(&result.params)
            }
        }
    }

    /// Retry a failed job, or hand the failure to the strategy once retries
    /// run out. `None` means a retry was submitted.
    fn handle_failure(
        &mut self,
        job: &EvaluationJob,
        failed: FailedEvaluation,
    ) -> PfResult<Option<Response>> {
        if job.attempt < self.config.max_job_retries {
            let retry = self.algorithm.core_mut().jobs.retry_job(job);
            self.stats.retries += 1;
            warn!(
                job = job.id,
                retry = retry.id,
                attempt = retry.attempt,
                error = %failed.message,
                "retrying failed job"
            );
            self.emit(FitEvent::JobRetried {
                failed_job_id: job.id,
                job_id: retry.id,
                attempt: retry.attempt,
            });
            self.dispatch(retry);
            return Ok(None);
        }

        self.stats.evaluations += 1;
        self.stats.failures += 1;
        error!(
            job = job.id,
            attempts = job.attempt + 1,
            error = %failed.message,
            "job failed; giving up on parameter set"
        );
        self.emit(FitEvent::JobFailed {
            job_id: job.id,
            message: failed.message,
        });
        self.algorithm.on_failure(&job.params).map(Some)
    }

    fn maybe_snapshot(&mut self) -> PfResult<()> {
        let every = self.config.output_every;
        let trajectory = self.algorithm.trajectory();
        if every == 0 || trajectory.len() % every != 0 {
            return Ok(());
        }
        let path = self.writer.write_snapshot(trajectory)?;
        self.emit(FitEvent::SnapshotWritten {
            path,
            entries: trajectory.len(),
        });
        Ok(())
    }

    /// Score and record completions that arrived after the stop. They are
    /// not given to the strategy.
    async fn record_late(&mut self) -> usize {
        let mut drained = 0;
        for evaluation in self.pool.drain().await {
            let Evaluation::Completed(mut result) = evaluation else {
                continue;
            };
            let recorded = self
                .score(&mut result)
                .and_then(|_| self.algorithm.record(&result));
            match recorded {
                Ok(()) => drained += 1,
                Err(e) => debug!(job = result.job_id, error = %e, "dropping late result"),
            }
        }
        if drained > 0 {
            debug!(drained, "recorded results that completed during shutdown");
        }
        drained
    }

    fn emit(&self, event: FitEvent) {
        if let Some(tx) = &self.events {
            // Best effort; a dropped receiver just stops the stream.
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, FnExecutor};
    use crate::objective::SumOfSquares;
    use crossbeam_channel::unbounded;
    use pf_optimizer::{AlgorithmCore, ParameterSpace};
    use pf_types::{
        AlgorithmConfig, AntColonyConfig, DataTable, JobFactory, SwarmConfig, VariableSpec,
    };
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table(value: f64) -> SimulationData {
        let mut t = DataTable::new(vec!["time".into(), "y".into()]);
        t.push_row(vec![0.0, value]);
        BTreeMap::from([("parabola".to_string(), BTreeMap::from([("out".to_string(), t)]))])
    }

    /// Simulated `y` is the parameter itself; experimental `y` is 3.
    fn parabola(job: &EvaluationJob) -> Result<SimulationData, ExecutorError> {
        let x = job
            .params
            .get("x")
            .ok_or_else(|| ExecutorError::failed("missing x"))?;
        Ok(table(x))
    }

    fn config(dir: &Path, algorithm: AlgorithmConfig) -> FitConfig {
        FitConfig::new("parabola", vec![VariableSpec::uniform("x", 0.0, 10.0)], algorithm)
            .with_output_dir(dir)
            .with_concurrency(3)
            .with_output_every(0)
            .with_seed(17)
    }

    #[tokio::test]
    async fn swarm_fit_finds_parabola_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::ParticleSwarm(SwarmConfig::new(5, 20)));
        let mut runner =
            FitRunner::local(config, FnExecutor::new(parabola), SumOfSquares, table(3.0)).unwrap();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.reason, StopReason::Criterion);
        assert_eq!(summary.evaluations, 100);
        assert_eq!(summary.failures, 0);
        assert!(summary.best_score.unwrap() < 0.5, "best = {:?}", summary.best_score);
        assert_eq!(
            runner.algorithm().trajectory().len(),
            summary.evaluations + summary.drained
        );
        assert_eq!(runner.outstanding(), 0);
        assert!(summary.final_snapshot.ends_with("Results/sorted_params_final.txt"));
        assert!(summary.final_snapshot.is_file());
        assert!(summary.finished_at >= summary.started_at);
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::AntColony(AntColonyConfig::new(6, 3)));
        let (tx, rx) = unbounded();
        let mut runner = FitRunner::local(config, FnExecutor::new(parabola), SumOfSquares, table(3.0))
            .unwrap()
            .with_events(tx);
        let summary = runner.run().await.unwrap();
        let events: Vec<FitEvent> = rx.try_iter().collect();

        assert!(matches!(events.first(), Some(FitEvent::Started { .. })));
        assert!(matches!(
            events.last(),
            Some(FitEvent::Stopped { reason: StopReason::Criterion, evaluations: 18, .. })
        ));
        let completed = events
            .iter()
            .filter(|e| matches!(e, FitEvent::JobCompleted { .. }))
            .count();
        assert_eq!(completed, summary.evaluations);
        let submitted = events
            .iter()
            .filter(|e| matches!(e, FitEvent::JobSubmitted { .. }))
            .count();
        assert!(submitted >= completed);
    }

    #[tokio::test]
    async fn failed_jobs_are_retried_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::ParticleSwarm(SwarmConfig::new(4, 3)));
        // Every even-numbered first attempt fails.
        let flaky = FnExecutor::new(|job: &EvaluationJob| {
            if job.attempt == 0 && job.id % 2 == 0 {
                Err(ExecutorError::failed("transient"))
            } else {
                parabola(job)
            }
        });
        let mut runner = FitRunner::local(config, flaky, SumOfSquares, table(3.0)).unwrap();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.evaluations, 12);
        assert_eq!(summary.failures, 0);
        assert!(summary.retries >= 2);
    }

    #[tokio::test]
    async fn persistent_failures_still_make_progress() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::AntColony(AntColonyConfig::new(4, 2)))
            .with_max_job_retries(0);
        let broken =
            FnExecutor::new(|_job: &EvaluationJob| Err(ExecutorError::failed("simulator crashed")));
        let mut runner = FitRunner::local(config, broken, SumOfSquares, table(3.0)).unwrap();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.reason, StopReason::Criterion);
        assert_eq!(summary.evaluations, 8);
        assert_eq!(summary.failures, 8);
        assert!(summary.best.is_none());
        assert!(runner.algorithm().trajectory().is_empty());
        let text = std::fs::read_to_string(&summary.final_snapshot).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[tokio::test]
    async fn panicking_job_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::ParticleSwarm(SwarmConfig::new(3, 2)));
        let executor = FnExecutor::new(|job: &EvaluationJob| {
            if job.id == 2 {
                panic!("simulator segfault");
            }
            parabola(job)
        });
        let mut runner = FitRunner::local(config, executor, SumOfSquares, table(3.0)).unwrap();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.retries, 1);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.evaluations, 6);
    }

    #[tokio::test]
    async fn unscorable_results_count_as_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::AntColony(AntColonyConfig::new(3, 2)));
        // Output never matches the experimental table's point.
        let mut wrong = DataTable::new(vec!["time".into(), "y".into()]);
        wrong.push_row(vec![99.0, 0.0]);
        let off_grid = BTreeMap::from([(
            "parabola".to_string(),
            BTreeMap::from([("out".to_string(), wrong)]),
        )]);
        let executor = FnExecutor::new(move |_job: &EvaluationJob| Ok(off_grid.clone()));
        let mut runner = FitRunner::local(config, executor, SumOfSquares, table(3.0)).unwrap();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.failures, 6);
        assert_eq!(summary.retries, 0);
        assert!(runner.algorithm().trajectory().is_empty());
    }

    #[tokio::test]
    async fn nan_scores_are_failures_not_results() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::AntColony(AntColonyConfig::new(3, 2)))
            .with_concurrency(1);
        let executor = FnExecutor::new(|job: &EvaluationJob| {
            if job.id == 1 {
                Ok(table(f64::NAN))
            } else {
                parabola(job)
            }
        });
        let mut runner = FitRunner::local(config, executor, SumOfSquares, table(3.0)).unwrap();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.evaluations, 6);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.retries, 0);
        assert!(summary.best_score.unwrap().is_finite());
        let trajectory = runner.algorithm().trajectory();
        assert_eq!(trajectory.len(), 5 + summary.drained);
        assert!(trajectory.entries().iter().all(|e| e.score.is_finite()));
    }

    #[tokio::test]
    async fn periodic_snapshots_follow_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::ParticleSwarm(SwarmConfig::new(4, 3)))
            .with_output_every(5)
            .with_concurrency(1);
        let mut runner =
            FitRunner::local(config, FnExecutor::new(parabola), SumOfSquares, table(3.0)).unwrap();
        runner.run().await.unwrap();

        let results = dir.path().join("Results");
        assert!(results.join("sorted_params_0.txt").is_file());
        assert!(results.join("sorted_params_1.txt").is_file());
        assert!(results.join("sorted_params_final.txt").is_file());
    }

    #[tokio::test]
    async fn delete_old_files_leaves_single_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::ParticleSwarm(SwarmConfig::new(4, 3)))
            .with_output_every(2)
            .with_delete_old_files(true);
        let mut runner =
            FitRunner::local(config, FnExecutor::new(parabola), SumOfSquares, table(3.0)).unwrap();
        let summary = runner.run().await.unwrap();

        let results = dir.path().join("Results");
        assert_eq!(summary.final_snapshot, results.join("sorted_params.txt"));
        assert_eq!(std::fs::read_dir(&results).unwrap().count(), 1);
    }

    /// Proposes one set and nothing after it.
    struct OneShot {
        core: AlgorithmCore,
    }

    impl Algorithm for OneShot {
        fn name(&self) -> &str {
            "one_shot"
        }

        fn core(&self) -> &AlgorithmCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut AlgorithmCore {
            &mut self.core
        }

        fn start(&mut self) -> PfResult<Vec<ParameterSet>> {
            Ok(vec![ParameterSet::from_pairs([("x", 4.0)])])
        }

        fn on_result(&mut self, _result: &EvaluationResult) -> PfResult<Response> {
            Ok(Response::Continue(Vec::new()))
        }

        fn on_failure(&mut self, _params: &ParameterSet) -> PfResult<Response> {
            Ok(Response::Continue(Vec::new()))
        }

        fn best(&self) -> Option<(&ParameterSet, f64)> {
            None
        }
    }

    /// Reports the first submitted job; everything else has already
    /// finished by the time it is cancelled.
    #[derive(Default)]
    struct ScriptedPool {
        queued: VecDeque<EvaluationJob>,
        finished: Vec<EvaluationJob>,
    }

    fn completed(job: EvaluationJob) -> Evaluation {
        let x = job.params.get("x").unwrap();
        Evaluation::Completed(EvaluationResult::new(job.id, job.params, table(x), Vec::new()))
    }

    #[async_trait]
    impl ExecutionPool for ScriptedPool {
        fn submit(&mut self, job: EvaluationJob) {
            self.queued.push_back(job);
        }

        async fn next_completed(&mut self) -> Option<Evaluation> {
            self.queued.pop_front().map(completed)
        }

        fn cancel(&mut self, job_id: JobId) -> bool {
            let before = self.queued.len();
            self.queued.retain(|job| job.id != job_id);
            before != self.queued.len()
        }

        fn cancel_all(&mut self) -> usize {
            let count = self.queued.len();
            self.finished.extend(self.queued.drain(..));
            count
        }

        async fn drain(&mut self) -> Vec<Evaluation> {
            self.finished.drain(..).map(completed).collect()
        }

        fn outstanding(&self) -> usize {
            self.queued.len()
        }
    }

    /// Proposes x = 4 and x = 3, stops on the first result.
    struct StopOnFirst {
        core: AlgorithmCore,
        results_seen: Arc<AtomicUsize>,
    }

    impl Algorithm for StopOnFirst {
        fn name(&self) -> &str {
            "stop_on_first"
        }

        fn core(&self) -> &AlgorithmCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut AlgorithmCore {
            &mut self.core
        }

        fn start(&mut self) -> PfResult<Vec<ParameterSet>> {
            Ok(vec![
                ParameterSet::from_pairs([("x", 4.0)]),
                ParameterSet::from_pairs([("x", 3.0)]),
            ])
        }

        fn on_result(&mut self, _result: &EvaluationResult) -> PfResult<Response> {
            self.results_seen.fetch_add(1, Ordering::SeqCst);
            Ok(Response::Stop)
        }

        fn on_failure(&mut self, _params: &ParameterSet) -> PfResult<Response> {
            Ok(Response::Stop)
        }

        fn best(&self) -> Option<(&ParameterSet, f64)> {
            None
        }
    }

    #[tokio::test]
    async fn late_completions_are_recorded_but_not_given_to_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::ParticleSwarm(SwarmConfig::new(1, 1)));
        let space = ParameterSpace::from_specs(&config.variables).unwrap();
        let results_seen = Arc::new(AtomicUsize::new(0));
        let algorithm = Box::new(StopOnFirst {
            core: AlgorithmCore::new(space, JobFactory::from_config(&config)),
            results_seen: Arc::clone(&results_seen),
        });
        let mut runner =
            FitRunner::new(config, algorithm, ScriptedPool::default(), SumOfSquares, table(3.0));
        let summary = runner.run().await.unwrap();

        assert_eq!(results_seen.load(Ordering::SeqCst), 1);
        assert_eq!(summary.reason, StopReason::Criterion);
        assert_eq!(summary.evaluations, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.drained, 1);
        // The drained x = 3 result is the exact fit.
        assert_eq!(summary.best_score, Some(0.0));
        assert_eq!(summary.best, Some(ParameterSet::from_pairs([("x", 3.0)])));
        assert_eq!(runner.algorithm().trajectory().len(), 2);

        let text = std::fs::read_to_string(&summary.final_snapshot).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["# score\tx", "0\t3", "1\t4"]);
    }

    #[tokio::test]
    async fn idle_pool_ends_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), AlgorithmConfig::ParticleSwarm(SwarmConfig::new(1, 1)));
        let space = ParameterSpace::from_specs(&config.variables).unwrap();
        let algorithm = Box::new(OneShot {
            core: AlgorithmCore::new(space, JobFactory::from_config(&config)),
        });
        let pool = LocalPool::new(FnExecutor::new(parabola), 1);
        let mut runner = FitRunner::new(config, algorithm, pool, SumOfSquares, table(3.0));
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.reason, StopReason::Idle);
        assert_eq!(summary.evaluations, 1);
        assert_eq!(summary.best_score, Some(1.0));
        assert_eq!(summary.cancelled, 0);
    }
}
