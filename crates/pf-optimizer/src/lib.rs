//! # pf-optimizer
//!
//! Optimization strategies for parameter fitting.
//!
//! Provides the parameter space (linear, logarithmic and fixed coordinates),
//! the [`Algorithm`] contract driven by the scheduling loop, and two
//! strategies: an asynchronous particle swarm and an archive-based ant colony.

mod algorithm;
mod ant_colony;
mod space;
mod swarm;

pub use algorithm::{build_algorithm, Algorithm, AlgorithmCore, Response, StagnationTracker};
pub use ant_colony::{AntColony, ArchiveEntry};
pub use space::{Coordinate, ParameterSpace, SpaceEntry};
pub use swarm::{Particle, ParticleSwarm, MAX_COLLISION_RETRIES};
