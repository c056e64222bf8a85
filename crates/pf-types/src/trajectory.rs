//! Append-only record of every scored parameter set.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

use crate::errors::PfResult;
use crate::params::ParameterSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub params: ParameterSet,
    pub score: f64,
}

/// Scored parameter sets in arrival order. Lower scores are better.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trajectory {
    entries: Vec<TrajectoryEntry>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, params: ParameterSet, score: f64) {
        self.entries.push(TrajectoryEntry { params, score });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in arrival order.
    pub fn entries(&self) -> &[TrajectoryEntry] {
        &self.entries
    }

    /// Entries best-first. Equal scores keep arrival order; NaN scores rank
    /// last.
    pub fn sorted(&self) -> Vec<&TrajectoryEntry> {
        let mut view: Vec<&TrajectoryEntry> = self.entries.iter().collect();
        view.sort_by(|a, b| {
            a.score
                .is_nan()
                .cmp(&b.score.is_nan())
                .then(a.score.total_cmp(&b.score))
        });
        view
    }

    /// Lowest-scoring entry, earliest on ties. NaN scores never win.
    pub fn best(&self) -> Option<&TrajectoryEntry> {
        self.entries
            .iter()
            .filter(|e| !e.score.is_nan())
            .min_by(|a, b| a.score.total_cmp(&b.score))
    }

    /// Write the ranked listing to `path`, creating parent directories.
    ///
    /// Format: a `# score` header followed by the variable names, then one
    /// tab-separated line per entry, best first.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> PfResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = BufWriter::new(File::create(path)?);
        let names: Vec<&str> = self
            .entries
            .first()
            .map(|e| e.params.names().collect())
            .unwrap_or_default();

        write!(out, "# score")?;
        for name in &names {
            write!(out, "\t{name}")?;
        }
        writeln!(out)?;

        for entry in self.sorted() {
            write!(out, "{}", entry.score)?;
            for name in &names {
                match entry.params.get(name) {
                    Some(v) => write!(out, "\t{v}")?,
                    None => write!(out, "\tNA")?,
                }
            }
            writeln!(out)?;
        }
        out.flush()?;
        debug!(path = %path.display(), entries = self.entries.len(), "wrote trajectory");
        Ok(())
    }
}
