//! Parent pyramid refresh: jobs, collaborator contract, dirty aggregation
//!
//! Successful anchors dirty their leaf footprints. The aggregator batches
//! dirty leaves into [`ParentRefreshJob`]s under three flush policies (time
//! debounce, wave-count batch, leaf-count batch) plus an unconditional flush
//! when generation finishes, and tracks the cumulative touched set for the
//! final catch-up job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::cancellation::CancelToken;
use crate::tile::{MapBounds, TileCoord};

/// One call to the parent refresh collaborator
#[derive(Debug, Clone)]
pub struct ParentLevelRequest {
    /// Zoom level of the tiles being collapsed
    pub child_z: u32,
    /// Deduplicated child tiles at `child_z`
    pub child_tiles: Vec<TileCoord>,
    /// Cancellation signal the collaborator must honor
    pub signal: CancelToken,
}

/// Failure of one parent refresh attempt
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ParentRefreshError {
    pub message: String,
    /// Backoff hint, e.g. surfaced from a rate-limited downstream
    pub retry_after: Option<Duration>,
}

impl ParentRefreshError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Collapses child tiles into parents for one zoom level.
///
/// Must be idempotent and honor the request signal. Returns the parent tiles
/// produced, which become the next level's children; an empty result
/// terminates the cascade.
#[async_trait]
pub trait ParentRefresher: Send + Sync {
    async fn refresh_parent_level(
        &self,
        request: &ParentLevelRequest,
    ) -> Result<Vec<TileCoord>, ParentRefreshError>;
}

/// Parent job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentJobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

/// A unit of parent pyramid rebuild
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentRefreshJob {
    pub id: u64,
    /// Zoom of the leaves in this job
    pub child_z: u32,
    /// Deduplicated dirty leaves
    pub leaves: Vec<TileCoord>,
    /// How many zoom levels upward to cascade before stopping
    pub max_levels: u32,
    pub status: ParentJobStatus,
    pub attempts: u32,
    /// Zoom level currently being collapsed, while running
    pub current_level: Option<u32>,
    pub error: Option<String>,
}

impl ParentRefreshJob {
    pub fn new(id: u64, child_z: u32, leaves: Vec<TileCoord>, max_levels: u32) -> Self {
        Self {
            id,
            child_z,
            leaves,
            max_levels,
            status: ParentJobStatus::Queued,
            attempts: 0,
            current_level: None,
            error: None,
        }
    }
}

/// Tracks dirty leaves between parent flushes.
///
/// Not thread-safe on its own; the engine owns it behind its serialization
/// point.
#[derive(Debug)]
pub(crate) struct DirtyParentAggregator {
    debounce: Duration,
    wave_batch_size: usize,
    leaf_batch_size: usize,
    dirty: BTreeSet<TileCoord>,
    touched: BTreeSet<TileCoord>,
    waves_since_flush: usize,
    first_mark_at: Option<Instant>,
}

impl DirtyParentAggregator {
    pub fn new(debounce: Duration, wave_batch_size: usize, leaf_batch_size: usize) -> Self {
        Self {
            debounce,
            wave_batch_size,
            leaf_batch_size,
            dirty: BTreeSet::new(),
            touched: BTreeSet::new(),
            waves_since_flush: 0,
            first_mark_at: None,
        }
    }

    /// Mark a successful anchor's footprint dirty, clipped to the map.
    pub fn mark_footprint(&mut self, center: TileCoord, bounds: MapBounds, now: Instant) {
        for tile in center.footprint3_clipped(bounds) {
            self.dirty.insert(tile);
            self.touched.insert(tile);
        }
        if self.first_mark_at.is_none() && !self.dirty.is_empty() {
            self.first_mark_at = Some(now);
        }
    }

    /// Record a completed wave that produced at least one success.
    pub fn note_wave(&mut self) {
        self.waves_since_flush += 1;
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    fn is_due(&self, now: Instant) -> bool {
        if self.dirty.is_empty() {
            return false;
        }
        if self.dirty.len() >= self.leaf_batch_size {
            return true;
        }
        if self.waves_since_flush >= self.wave_batch_size {
            return true;
        }
        match self.first_mark_at {
            Some(first) => now.duration_since(first) >= self.debounce,
            None => false,
        }
    }

    /// Drain the dirty set if any flush policy fires.
    pub fn flush_if_due(&mut self, now: Instant) -> Option<Vec<TileCoord>> {
        if self.is_due(now) {
            self.flush()
        } else {
            None
        }
    }

    /// Drain the dirty set unconditionally (generation finished).
    pub fn flush(&mut self) -> Option<Vec<TileCoord>> {
        if self.dirty.is_empty() {
            return None;
        }
        let leaves: Vec<TileCoord> = std::mem::take(&mut self.dirty).into_iter().collect();
        self.waves_since_flush = 0;
        self.first_mark_at = None;
        Some(leaves)
    }

    /// Drain the cumulative touched set for the final catch-up job.
    pub fn take_touched(&mut self) -> Vec<TileCoord> {
        std::mem::take(&mut self.touched).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: MapBounds = MapBounds {
        width: 64,
        height: 64,
    };

    fn aggregator(debounce_ms: u64, wave_batch: usize, leaf_batch: usize) -> DirtyParentAggregator {
        DirtyParentAggregator::new(Duration::from_millis(debounce_ms), wave_batch, leaf_batch)
    }

    #[test]
    fn marks_are_deduplicated() {
        let mut agg = aggregator(60_000, 64, 10_000);
        let now = Instant::now();
        agg.mark_footprint(TileCoord::new(20, 20), BOUNDS, now);
        agg.mark_footprint(TileCoord::new(21, 20), BOUNDS, now);
        // Overlapping 3x3 footprints: 9 + 3 new columns.
        assert_eq!(agg.dirty_len(), 12);
    }

    #[test]
    fn leaf_batch_policy_fires() {
        let mut agg = aggregator(60_000, 64, 10);
        let now = Instant::now();
        agg.mark_footprint(TileCoord::new(20, 20), BOUNDS, now);
        assert!(agg.flush_if_due(now).is_none());
        agg.mark_footprint(TileCoord::new(30, 30), BOUNDS, now);
        let leaves = agg.flush_if_due(now).unwrap();
        assert_eq!(leaves.len(), 18);
        assert_eq!(agg.dirty_len(), 0);
    }

    #[test]
    fn wave_batch_policy_fires() {
        let mut agg = aggregator(60_000, 2, 10_000);
        let now = Instant::now();
        agg.mark_footprint(TileCoord::new(20, 20), BOUNDS, now);
        agg.note_wave();
        assert!(agg.flush_if_due(now).is_none());
        agg.note_wave();
        assert!(agg.flush_if_due(now).is_some());
        // Counter resets with the flush.
        agg.mark_footprint(TileCoord::new(30, 30), BOUNDS, now);
        assert!(agg.flush_if_due(now).is_none());
    }

    #[test]
    fn debounce_policy_fires_after_first_mark() {
        let mut agg = aggregator(1000, 64, 10_000);
        let start = Instant::now();
        agg.mark_footprint(TileCoord::new(20, 20), BOUNDS, start);
        assert!(agg.flush_if_due(start + Duration::from_millis(500)).is_none());
        assert!(agg
            .flush_if_due(start + Duration::from_millis(1500))
            .is_some());
    }

    #[test]
    fn empty_dirty_set_never_flushes() {
        let mut agg = aggregator(0, 1, 1);
        agg.note_wave();
        assert!(agg.flush_if_due(Instant::now()).is_none());
        assert!(agg.flush().is_none());
    }

    #[test]
    fn touched_set_accumulates_across_flushes() {
        let mut agg = aggregator(60_000, 64, 10_000);
        let now = Instant::now();
        agg.mark_footprint(TileCoord::new(20, 20), BOUNDS, now);
        agg.flush().unwrap();
        agg.mark_footprint(TileCoord::new(40, 40), BOUNDS, now);
        agg.flush().unwrap();
        assert_eq!(agg.take_touched().len(), 18);
        assert!(agg.take_touched().is_empty());
    }
}
