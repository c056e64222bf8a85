//! # pf-engine
//!
//! Asynchronous scheduling for parameter fitting.
//!
//! [`FitRunner`] drives an optimization strategy from `pf-optimizer` against
//! an [`ExecutionPool`]: jobs run concurrently, completions are scored by an
//! [`Objective`] and handed to the strategy one at a time, and ranked
//! trajectory snapshots are written under `<output_dir>/Results`.

pub mod events;
pub mod executor;
pub mod objective;
pub mod output;
pub mod pool;
pub mod scheduler;

pub use events::{FitEvent, FitSummary, StopReason};
pub use executor::{
    run_job, ExecutorError, ExecutorResult, FnExecutor, ModelExecutor, SimulationOutput,
};
pub use objective::{Objective, SumOfSquares};
pub use output::ResultsWriter;
pub use pool::{ExecutionPool, LocalPool};
pub use scheduler::FitRunner;
