//! Events emitted while a fit runs, and the summary returned at the end.

use chrono::{DateTime, Duration, Utc};
use pf_types::{JobId, ParameterSet, RunId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why the scheduling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The strategy's stop criterion was met.
    Criterion,
    /// No work was outstanding and the strategy proposed none.
    Idle,
}

/// Events emitted by [`crate::FitRunner`] for external consumption (logging,
/// progress display).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitEvent {
    Started {
        run_id: RunId,
        algorithm: String,
    },
    JobSubmitted {
        job_id: JobId,
        attempt: usize,
    },
    JobCompleted {
        job_id: JobId,
        score: f64,
    },
    JobFailed {
        job_id: JobId,
        message: String,
    },
    JobRetried {
        failed_job_id: JobId,
        job_id: JobId,
        attempt: usize,
    },
    SnapshotWritten {
        path: PathBuf,
        entries: usize,
    },
    Stopped {
        run_id: RunId,
        reason: StopReason,
        evaluations: usize,
    },
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub run_id: RunId,
    pub algorithm: String,
    pub reason: StopReason,
    /// Results and final failures handed to the strategy.
    pub evaluations: usize,
    /// Jobs whose retries ran out, plus results that could not be scored.
    pub failures: usize,
    pub retries: usize,
    /// Jobs still outstanding at stop.
    pub cancelled: usize,
    /// Completions drained after stop and recorded without the strategy.
    pub drained: usize,
    pub best: Option<ParameterSet>,
    pub best_score: Option<f64>,
    pub final_snapshot: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FitSummary {
    pub fn duration(&self) -> Duration {
        self.finished_at.signed_duration_since(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_variant_tags() {
        let event = FitEvent::JobRetried {
            failed_job_id: 4,
            job_id: 9,
            attempt: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"JobRetried":{"failed_job_id":4,"job_id":9,"attempt":1}}"#);
        let back: FitEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn summary_duration() {
        let started_at = Utc::now();
        let summary = FitSummary {
            run_id: RunId::nil(),
            algorithm: "particle_swarm".into(),
            reason: StopReason::Criterion,
            evaluations: 10,
            failures: 0,
            retries: 0,
            cancelled: 2,
            drained: 0,
            best: None,
            best_score: None,
            final_snapshot: PathBuf::from("out/Results/sorted_params_final.txt"),
            started_at,
            finished_at: started_at + Duration::seconds(3),
        };
        assert_eq!(summary.duration().num_seconds(), 3);
    }
}
