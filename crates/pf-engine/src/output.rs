//! Trajectory snapshots under `<output_dir>/Results`.

use pf_types::{FitConfig, PfResult, Trajectory};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes ranked `sorted_params_<name>.txt` snapshots.
#[derive(Debug, Clone)]
pub struct ResultsWriter {
    results_dir: PathBuf,
    delete_old_files: bool,
    counter: usize,
}

impl ResultsWriter {
    pub fn new(results_dir: impl Into<PathBuf>, delete_old_files: bool) -> Self {
        Self {
            results_dir: results_dir.into(),
            delete_old_files,
            counter: 0,
        }
    }

    pub fn from_config(config: &FitConfig) -> Self {
        Self::new(config.results_dir(), config.delete_old_files)
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Snapshots written so far.
    pub fn written(&self) -> usize {
        self.counter
    }

    /// Snapshot named after the running counter.
    pub fn write_snapshot(&mut self, trajectory: &Trajectory) -> PfResult<PathBuf> {
        let name = self.counter.to_string();
        self.write_named(trajectory, &name)
    }

    /// Snapshot with an explicit name, e.g. `final`. Returns where it ended
    /// up: `sorted_params.txt` when only the latest snapshot is kept.
    pub fn write_named(&mut self, trajectory: &Trajectory, name: &str) -> PfResult<PathBuf> {
        self.counter += 1;
        let path = self.results_dir.join(format!("sorted_params_{name}.txt"));
        trajectory.write_to_file(&path)?;

        let path = if self.delete_old_files {
            let latest = self.results_dir.join("sorted_params.txt");
            if latest.is_file() {
                fs::remove_file(&latest)?;
            }
            fs::rename(&path, &latest)?;
            latest
        } else {
            path
        };
        info!(path = %path.display(), entries = trajectory.len(), "wrote results snapshot");
        Ok(path)
    }
}
