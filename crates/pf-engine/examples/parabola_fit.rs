//! Fit the coefficients of `y = a t^2 + b t + c` to synthetic data.
//!
//! Usage: `cargo run -p pf-engine --example parabola_fit [config.json]`
//! Set `RUST_LOG=debug` for per-job logging.

use async_trait::async_trait;
use pf_engine::{
    ExecutorError, ExecutorResult, FitEvent, FitRunner, ModelExecutor, SimulationOutput,
    SumOfSquares,
};
use pf_types::{
    AlgorithmConfig, DataTable, EvaluationJob, FitConfig, ModelRef, SimulationData, SwarmConfig,
    VariableSpec,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TRUE_COEFFICIENTS: (f64, f64, f64) = (3.0, -2.0, 7.5);

fn curve(a: f64, b: f64, c: f64) -> SimulationData {
    let mut table = DataTable::new(vec!["time".into(), "y".into()]);
    for step in 0..=10 {
        let t = step as f64;
        table.push_row(vec![t, a * t * t + b * t + c]);
    }
    BTreeMap::from([("parabola".to_string(), BTreeMap::from([("par1".to_string(), table)]))])
}

/// Stands in for an external simulator: a short delay, then the curve.
struct ParabolaModel;

#[async_trait]
impl ModelExecutor for ParabolaModel {
    async fn execute(&self, job: &EvaluationJob) -> ExecutorResult<SimulationOutput> {
        let value = |name: &str| {
            job.params
                .get(name)
                .ok_or_else(|| ExecutorError::failed(format!("missing {name}")))
        };
        let (a, b, c) = (value("v1__FREE")?, value("v2__FREE")?, value("v3__FREE")?);
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(SimulationOutput {
            data: curve(a, b, c),
            log: vec![format!("job {} simulated", job.id)],
        })
    }
}

fn default_config() -> FitConfig {
    FitConfig::new(
        "parabola",
        vec![
            VariableSpec::uniform("v1__FREE", 0.0, 10.0),
            VariableSpec::uniform("v2__FREE", -10.0, 10.0),
            VariableSpec::log_uniform("v3__FREE", 0.1, 100.0),
        ],
        AlgorithmConfig::ParticleSwarm(
            SwarmConfig::new(20, 60)
                .with_inertia(0.9, 0.4, 10)
                .with_stagnation(15, 1e-6, 1e-4),
        ),
    )
    .with_models(vec![ModelRef::new("parabola", "parabola.bngl").with_suffix("par1")])
    .with_output_dir("parabola_output")
    .with_concurrency(8)
    .with_output_every(200)
    .with_delete_old_files(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => FitConfig::from_json_file(path)?,
        None => default_config(),
    };

    let (a, b, c) = TRUE_COEFFICIENTS;
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut runner = FitRunner::local(config, ParabolaModel, SumOfSquares, curve(a, b, c))?
        .with_events(tx);
    let summary = runner.run().await?;

    let retries = rx
        .try_iter()
        .filter(|e| matches!(e, FitEvent::JobRetried { .. }))
        .count();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("retried jobs: {retries}, wall time: {} ms", summary.duration().num_milliseconds());
    Ok(())
}
