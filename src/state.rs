//! Run state snapshots and progress accounting
//!
//! The engine publishes an immutable [`BatchRunState`] snapshot to the
//! observer after every meaningful transition. Snapshots are deep copies;
//! observers never see mid-transition state and never see state go backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::anchor::{Anchor, AnchorId, AnchorStatus};
use crate::parents::{ParentJobStatus, ParentRefreshJob};
use crate::plan::CoverageBounds;
use crate::tile::TileCoord;

/// Unique identifier for a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Constructed but not yet driven
    Idle,
    /// Generation in progress
    Running,
    /// Generation finished; parent pyramid still catching up
    Completing,
    /// All work done
    Completed,
    /// A parent job exhausted its retries, or an invariant was violated
    Failed,
    /// External cancellation fired
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// A record of anchors started together and their outcomes.
///
/// In `wave_barrier` mode a wave is a set of anchors started at once; in
/// `rolling_fill` mode each completion produces its own single-anchor record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    /// Monotonic index, starting at 1
    pub index: u32,
    /// Anchors in this wave
    pub task_ids: Vec<AnchorId>,
    pub succeeded: Vec<AnchorId>,
    pub failed: Vec<AnchorId>,
    /// Anchors newly blocked by this wave's failures
    pub blocked: Vec<AnchorId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Aggregated anchor progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub blocked: usize,
    pub waves_completed: usize,
}

impl GenerateProgress {
    pub fn from_anchors(anchors: &HashMap<AnchorId, Anchor>, waves_completed: usize) -> Self {
        let mut progress = GenerateProgress {
            total: anchors.len(),
            waves_completed,
            ..Default::default()
        };
        for anchor in anchors.values() {
            match anchor.status {
                AnchorStatus::Pending => progress.pending += 1,
                AnchorStatus::Running => progress.running += 1,
                AnchorStatus::Success => progress.success += 1,
                AnchorStatus::Failed => progress.failed += 1,
                AnchorStatus::Blocked => progress.blocked += 1,
            }
        }
        progress
    }
}

/// Aggregated parent pyramid progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentProgress {
    pub queued: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    /// Lowest zoom level currently being refreshed, `None` when idle
    pub current_level_z: Option<u32>,
}

impl ParentProgress {
    pub fn from_jobs(jobs: &[ParentRefreshJob]) -> Self {
        let mut progress = ParentProgress::default();
        for job in jobs {
            match job.status {
                ParentJobStatus::Queued => progress.queued += 1,
                ParentJobStatus::Running => progress.running += 1,
                ParentJobStatus::Success => progress.success += 1,
                ParentJobStatus::Failed => progress.failed += 1,
            }
        }
        progress.current_level_z = jobs
            .iter()
            .filter(|j| j.status == ParentJobStatus::Running)
            .filter_map(|j| j.current_level)
            .min();
        progress
    }
}

/// The full externally-visible snapshot of a batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRunState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub origin: TileCoord,
    pub layers: i32,
    pub max_parallel: usize,
    pub anchors: HashMap<AnchorId, Anchor>,
    pub waves: Vec<Wave>,
    pub parent_jobs: Vec<ParentRefreshJob>,
    pub generate: GenerateProgress,
    pub parents: ParentProgress,
    pub coverage: Option<CoverageBounds>,
    /// Fatal error message, set when the run fails
    pub error: Option<String>,
}

/// Observer for state snapshots
///
/// Called synchronously from the engine's serialization point after each
/// transition; implementations should be fast and must not block.
pub trait StateObserver: Send + Sync {
    fn on_state(&self, snapshot: BatchRunState);
}

impl<F> StateObserver for F
where
    F: Fn(BatchRunState) + Send + Sync,
{
    fn on_state(&self, snapshot: BatchRunState) {
        self(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::Priority;

    fn anchor(u: i32, v: i32, status: AnchorStatus) -> Anchor {
        Anchor {
            id: AnchorId::new(u, v),
            u,
            v,
            x: 20 + 2 * u,
            y: 20 + 2 * v,
            deps: Vec::new(),
            dependents: Vec::new(),
            priority: Priority {
                distance: u.unsigned_abs() + v.unsigned_abs(),
                bucket: 0,
                quadrant: 4,
            },
            status,
            attempts: 0,
            wave: None,
            started_at: None,
            finished_at: None,
            blocked_by: None,
            error: None,
        }
    }

    #[test]
    fn generate_progress_counts_statuses() {
        let mut anchors = HashMap::new();
        anchors.insert(AnchorId::new(0, 0), anchor(0, 0, AnchorStatus::Success));
        anchors.insert(AnchorId::new(1, 0), anchor(1, 0, AnchorStatus::Failed));
        anchors.insert(AnchorId::new(2, 0), anchor(2, 0, AnchorStatus::Blocked));
        anchors.insert(AnchorId::new(0, 1), anchor(0, 1, AnchorStatus::Running));
        anchors.insert(AnchorId::new(0, 2), anchor(0, 2, AnchorStatus::Pending));

        let progress = GenerateProgress::from_anchors(&anchors, 3);
        assert_eq!(progress.total, 5);
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.running, 1);
        assert_eq!(progress.success, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.blocked, 1);
        assert_eq!(progress.waves_completed, 3);
    }

    #[test]
    fn parent_progress_tracks_lowest_running_level() {
        let mut jobs = vec![
            ParentRefreshJob::new(1, 6, vec![TileCoord::new(4, 4)], 2),
            ParentRefreshJob::new(2, 6, vec![TileCoord::new(8, 8)], 2),
        ];
        jobs[0].status = ParentJobStatus::Running;
        jobs[0].current_level = Some(5);
        jobs[1].status = ParentJobStatus::Running;
        jobs[1].current_level = Some(6);

        let progress = ParentProgress::from_jobs(&jobs);
        assert_eq!(progress.running, 2);
        assert_eq!(progress.current_level_z, Some(5));

        jobs[0].status = ParentJobStatus::Success;
        jobs[0].current_level = None;
        jobs[1].status = ParentJobStatus::Queued;
        jobs[1].current_level = None;
        let progress = ParentProgress::from_jobs(&jobs);
        assert_eq!(progress.current_level_z, None);
        assert_eq!(progress.success, 1);
        assert_eq!(progress.queued, 1);
    }

    #[test]
    fn snapshot_serializes_with_string_anchor_keys() {
        let mut anchors = HashMap::new();
        anchors.insert(AnchorId::new(-1, 2), anchor(-1, 2, AnchorStatus::Pending));
        let state = BatchRunState {
            run_id: RunId::new(),
            status: RunStatus::Running,
            origin: TileCoord::new(20, 20),
            layers: 2,
            max_parallel: 4,
            anchors,
            waves: Vec::new(),
            parent_jobs: Vec::new(),
            generate: GenerateProgress::default(),
            parents: ParentProgress::default(),
            coverage: None,
            error: None,
        };

        let json = serde_json::to_value(&state).unwrap();
        assert!(json["anchors"]["u:-1,v:2"].is_object());
        assert_eq!(json["status"], "running");
    }
}
