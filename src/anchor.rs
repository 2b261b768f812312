//! Anchors: the unit of scheduling
//!
//! An anchor is one 3x3 edit centered on a leaf tile. Anchors are identified
//! by their offset from the batch origin and form a dependency tree rooted at
//! the origin anchor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::BatchError;
use crate::tile::{MapBounds, TileCoord};

/// Stable anchor identifier derived from the offset `(u, v)` from the origin.
///
/// Renders as `"u:{u},v:{v}"`, which is also its serialized form and the key
/// used in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorId {
    pub u: i32,
    pub v: i32,
}

impl AnchorId {
    pub fn new(u: i32, v: i32) -> Self {
        Self { u, v }
    }
}

impl std::fmt::Display for AnchorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u:{},v:{}", self.u, self.v)
    }
}

impl FromStr for AnchorId {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BatchError::Internal(format!("Malformed anchor id '{}'", s));
        let rest = s.strip_prefix("u:").ok_or_else(bad)?;
        let (u, v) = rest.split_once(",v:").ok_or_else(bad)?;
        Ok(Self {
            u: u.parse().map_err(|_| bad())?,
            v: v.parse().map_err(|_| bad())?,
        })
    }
}

impl Serialize for AnchorId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AnchorId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Anchor scheduling status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    /// Waiting for its dependency and a free slot
    Pending,
    /// Execution in flight
    Running,
    /// Generated and committed
    Success,
    /// Exhausted its retries
    Failed,
    /// An ancestor failed; this anchor will never run
    Blocked,
}

/// Priority triple; smaller sorts earlier. The full tie-break chain lives in
/// the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority {
    /// Manhattan distance `|u| + |v|` from the origin
    pub distance: u32,
    /// 0 origin, 1 axis-X, 2 axis-Y, 3 interior
    pub bucket: u8,
    /// NE=0, NW=1, SE=2, SW=3 for interior anchors; 4 for origin and axes
    pub quadrant: u8,
}

/// One 3x3 edit centered at leaf tile `(x, y)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    /// Stable identifier, `"u:{u},v:{v}"`
    pub id: AnchorId,
    /// Offset from the origin anchor
    pub u: i32,
    pub v: i32,
    /// Center tile at the leaf zoom
    pub x: i32,
    pub y: i32,
    /// Anchor ids this anchor waits for (at most one; the tree parent)
    pub deps: Vec<AnchorId>,
    /// Reverse edges, for O(1) blocked propagation
    pub dependents: Vec<AnchorId>,
    pub priority: Priority,
    pub status: AnchorStatus,
    /// Execution attempts so far
    pub attempts: u32,
    /// Wave this anchor was recorded in
    pub wave: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The failed ancestor that blocked this anchor
    pub blocked_by: Option<AnchorId>,
    /// Final error message when failed
    pub error: Option<String>,
}

impl Anchor {
    pub fn center(&self) -> TileCoord {
        TileCoord::new(self.x, self.y)
    }

    /// Whether the 3x3 footprints of two anchors share any tile.
    pub fn conflicts_with(&self, other: &Anchor) -> bool {
        (self.x - other.x).abs() <= 2 && (self.y - other.y).abs() <= 2
    }

    /// The anchor's footprint clipped to the map.
    pub fn footprint(&self, bounds: MapBounds) -> Vec<TileCoord> {
        self.center().footprint3_clipped(bounds)
    }

    pub(crate) fn mark_running(&mut self, wave: Option<u32>, now: DateTime<Utc>) {
        self.status = AnchorStatus::Running;
        self.wave = wave;
        self.started_at = Some(now);
    }

    pub(crate) fn mark_success(&mut self, attempts: u32, now: DateTime<Utc>) {
        self.status = AnchorStatus::Success;
        self.attempts = attempts;
        self.finished_at = Some(now);
    }

    pub(crate) fn mark_failed(&mut self, message: String, attempts: u32, now: DateTime<Utc>) {
        self.status = AnchorStatus::Failed;
        self.attempts = attempts;
        self.error = Some(message);
        self.finished_at = Some(now);
    }

    pub(crate) fn mark_blocked(&mut self, by: Option<AnchorId>) {
        self.status = AnchorStatus::Blocked;
        self.blocked_by = by;
    }

    /// Cancellation is not a failure: an in-flight anchor returns to PENDING.
    pub(crate) fn revert_to_pending(&mut self, attempts: u32) {
        self.status = AnchorStatus::Pending;
        self.attempts = attempts;
        self.wave = None;
        self.started_at = None;
    }
}
