//! Batch anchor scheduler for dependency-ordered tile edits
//!
//! This crate drives large regeneration batches over a 2D tile grid. A run
//! expands an origin tile into a set of overlapping 3x3 "anchor" edits,
//! executes them center-out in dependency order with overlap-safe
//! parallelism, optionally gates each edit behind a human review queue, and
//! asynchronously rebuilds the pyramid of coarser parent tiles as leaves
//! change.
//!
//! Tile generation and parent collapsing live behind the narrow
//! [`AnchorExecutor`] and [`ParentRefresher`] collaborator seams; the
//! scheduler owns no I/O of its own.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod anchor;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod executor;
pub mod parents;
pub mod plan;
pub mod review;
pub mod runner;
pub mod state;
pub mod tile;

pub use anchor::{Anchor, AnchorId, AnchorStatus, Priority};
pub use cancellation::{sleep_cancellable, CancelToken};
pub use config::{BatchConfig, BatchRunInput, ModelVariant, SchedulingMode};
pub use error::{BatchError, BatchResult};
pub use executor::{start_batch_run, BatchRunHandle};
pub use parents::{
    ParentJobStatus, ParentLevelRequest, ParentRefreshError, ParentRefreshJob, ParentRefresher,
};
pub use plan::{build_plan, BatchPlan, CoverageBounds};
pub use review::{
    PreviewGenerator, ReviewDecision, ReviewQueue, ReviewRequest, ReviewedExecutor,
};
pub use runner::{AnchorExecError, AnchorExecutor, AttemptContext};
pub use state::{
    BatchRunState, GenerateProgress, ParentProgress, RunId, RunStatus, StateObserver, Wave,
};
pub use tile::{MapBounds, TileCoord};
