//! Objective functions: how far simulated output is from experimental data.

use pf_types::{DataTable, EvaluationError, PfResult, SimulationData};

/// Scores simulation output against experimental data. Lower is better.
///
/// Implementations must be pure: the same inputs always give the same score.
pub trait Objective: Send + Sync {
    fn evaluate(&self, simulated: &SimulationData, experimental: &SimulationData) -> PfResult<f64>;
}

impl<F> Objective for F
where
    F: Fn(&SimulationData, &SimulationData) -> PfResult<f64> + Send + Sync,
{
    fn evaluate(&self, simulated: &SimulationData, experimental: &SimulationData) -> PfResult<f64> {
        self(simulated, experimental)
    }
}

/// Sum of squared residuals over every experimental point.
///
/// The first column of each table is the independent variable; experimental
/// points are matched to simulated rows with the same independent value.
/// `NaN` experimental values are treated as missing and skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumOfSquares;

impl SumOfSquares {
    fn table_score(name: &str, sim: &DataTable, exp: &DataTable) -> PfResult<f64> {
        let columns = exp
            .columns
            .iter()
            .enumerate()
            .skip(1)
            .map(|(exp_idx, column)| {
                sim.columns
                    .iter()
                    .position(|c| c == column)
                    .map(|sim_idx| (exp_idx, sim_idx))
                    .ok_or_else(|| EvaluationError::MissingColumn {
                        table: name.to_string(),
                        column: column.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut total = 0.0;
        for exp_row in &exp.rows {
            let Some(&x) = exp_row.first() else { continue };
            let sim_row = sim
                .rows
                .iter()
                .find(|row| row.first().is_some_and(|&sx| same_point(sx, x)))
                .ok_or_else(|| EvaluationError::MissingPoint {
                    table: name.to_string(),
                    x,
                })?;
            for &(exp_idx, sim_idx) in &columns {
                let observed = exp_row.get(exp_idx).copied().unwrap_or(f64::NAN);
                if observed.is_nan() {
                    continue;
                }
                let predicted = sim_row.get(sim_idx).copied().unwrap_or(f64::NAN);
                total += (predicted - observed).powi(2);
            }
        }
        Ok(total)
    }
}

fn same_point(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

impl Objective for SumOfSquares {
    fn evaluate(&self, simulated: &SimulationData, experimental: &SimulationData) -> PfResult<f64> {
        let mut total = 0.0;
        for (model, tables) in experimental {
            for (suffix, exp) in tables {
                let sim = simulated
                    .get(model)
                    .and_then(|outputs| outputs.get(suffix))
                    .ok_or_else(|| EvaluationError::MissingOutput {
                        model: model.clone(),
                        suffix: suffix.clone(),
                    })?;
                total += Self::table_score(&format!("{model}.{suffix}"), sim, exp)?;
            }
        }
        Ok(total)
    }
}
