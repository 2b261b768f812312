//! Run input, validation, and clamped configuration

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancelToken;
use crate::error::{BatchError, BatchResult};
use crate::parents::ParentRefresher;
use crate::runner::AnchorExecutor;
use crate::state::StateObserver;
use crate::tile::{MapBounds, TileCoord};

/// Generator model variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    #[default]
    Standard,
    Pro,
    FlashPreview,
}

impl ModelVariant {
    /// The next-stronger variant, used when a review rejects a preview.
    pub fn escalate(self) -> ModelVariant {
        match self {
            ModelVariant::FlashPreview => ModelVariant::Standard,
            ModelVariant::Standard => ModelVariant::Pro,
            ModelVariant::Pro => ModelVariant::Pro,
        }
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelVariant::Standard => "standard",
            ModelVariant::Pro => "pro",
            ModelVariant::FlashPreview => "flash_preview",
        };
        f.write_str(s)
    }
}

/// How the scheduler fills its parallelism cap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Start up to `max_parallel` anchors, wait for all of them, repeat
    #[default]
    WaveBarrier,
    /// Start a new anchor whenever a slot frees up
    RollingFill,
}

/// Input to [`crate::start_batch_run`]
///
/// Numeric fields are clamped by [`BatchRunInput::normalize`]; see each
/// field's range there. Collaborators default to "not provided", which fails
/// the run on first use.
pub struct BatchRunInput {
    pub origin_x: i32,
    pub origin_y: i32,
    pub layers: i32,
    /// Leaf zoom level; parent cascades start here
    pub z: u32,
    pub map_width: i32,
    pub map_height: i32,
    pub prompt: String,
    pub model_variant: ModelVariant,
    pub max_parallel: usize,
    pub max_generate_retries: u32,
    pub parent_job_retries: u32,
    pub parent_worker_concurrency: usize,
    pub parent_debounce_ms: u64,
    pub parent_wave_batch_size: usize,
    pub parent_leaf_batch_size: usize,
    pub parent_cascade_depth: u32,
    pub scheduling_mode: SchedulingMode,
    /// External cancellation; a fresh token is created when absent
    pub signal: Option<CancelToken>,
    pub on_state: Option<Arc<dyn StateObserver>>,
    pub execute_anchor: Option<Arc<dyn AnchorExecutor>>,
    pub refresh_parent_level: Option<Arc<dyn ParentRefresher>>,
}

impl BatchRunInput {
    pub fn new(
        origin_x: i32,
        origin_y: i32,
        z: u32,
        map_width: i32,
        map_height: i32,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            origin_x,
            origin_y,
            layers: 1,
            z,
            map_width,
            map_height,
            prompt: prompt.into(),
            model_variant: ModelVariant::Standard,
            max_parallel: 4,
            max_generate_retries: 3,
            parent_job_retries: 2,
            parent_worker_concurrency: 1,
            parent_debounce_ms: 1000,
            parent_wave_batch_size: 3,
            parent_leaf_batch_size: 256,
            parent_cascade_depth: 2,
            scheduling_mode: SchedulingMode::WaveBarrier,
            signal: None,
            on_state: None,
            execute_anchor: None,
            refresh_parent_level: None,
        }
    }

    /// Validate and clamp into a [`BatchConfig`].
    ///
    /// Rejects an empty prompt and non-positive map dimensions. An
    /// out-of-bounds origin is not an error: it produces an empty plan and an
    /// immediately completed run.
    pub fn normalize(&self) -> BatchResult<BatchConfig> {
        let prompt = self.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(BatchError::Config("prompt must not be empty".to_string()));
        }
        if self.map_width <= 0 || self.map_height <= 0 {
            return Err(BatchError::Config(format!(
                "map dimensions must be positive, got {}x{}",
                self.map_width, self.map_height
            )));
        }

        Ok(BatchConfig {
            origin: TileCoord::new(self.origin_x, self.origin_y),
            layers: self.layers.clamp(0, 256),
            leaf_z: self.z,
            bounds: MapBounds::new(self.map_width, self.map_height),
            prompt,
            model_variant: self.model_variant,
            max_parallel: self.max_parallel.clamp(1, 16),
            max_generate_retries: self.max_generate_retries.min(10),
            parent_job_retries: self.parent_job_retries.min(10),
            parent_worker_concurrency: self.parent_worker_concurrency.clamp(1, 4),
            parent_debounce: Duration::from_millis(self.parent_debounce_ms.min(60_000)),
            parent_wave_batch_size: self.parent_wave_batch_size.clamp(1, 64),
            parent_leaf_batch_size: self.parent_leaf_batch_size.clamp(1, 10_000),
            parent_cascade_depth: self.parent_cascade_depth.min(self.z),
            scheduling_mode: self.scheduling_mode,
        })
    }
}

/// Validated, clamped run configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub origin: TileCoord,
    pub layers: i32,
    pub leaf_z: u32,
    pub bounds: MapBounds,
    pub prompt: String,
    pub model_variant: ModelVariant,
    pub max_parallel: usize,
    pub max_generate_retries: u32,
    pub parent_job_retries: u32,
    pub parent_worker_concurrency: usize,
    pub parent_debounce: Duration,
    pub parent_wave_batch_size: usize,
    pub parent_leaf_batch_size: usize,
    pub parent_cascade_depth: u32,
    pub scheduling_mode: SchedulingMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = BatchRunInput::new(20, 20, 6, 64, 64, "a forest").normalize().unwrap();
        assert_eq!(cfg.max_parallel, 4);
        assert_eq!(cfg.max_generate_retries, 3);
        assert_eq!(cfg.parent_job_retries, 2);
        assert_eq!(cfg.parent_worker_concurrency, 1);
        assert_eq!(cfg.parent_debounce, Duration::from_millis(1000));
        assert_eq!(cfg.parent_wave_batch_size, 3);
        assert_eq!(cfg.parent_leaf_batch_size, 256);
        assert_eq!(cfg.parent_cascade_depth, 2);
        assert_eq!(cfg.scheduling_mode, SchedulingMode::WaveBarrier);
        assert_eq!(cfg.model_variant, ModelVariant::Standard);
    }

    #[test]
    fn numeric_fields_are_clamped() {
        let mut input = BatchRunInput::new(20, 20, 6, 64, 64, "prompt");
        input.layers = 1000;
        input.max_parallel = 99;
        input.max_generate_retries = 99;
        input.parent_job_retries = 99;
        input.parent_worker_concurrency = 0;
        input.parent_debounce_ms = 600_000;
        input.parent_wave_batch_size = 0;
        input.parent_leaf_batch_size = 1_000_000;
        input.parent_cascade_depth = 99;

        let cfg = input.normalize().unwrap();
        assert_eq!(cfg.layers, 256);
        assert_eq!(cfg.max_parallel, 16);
        assert_eq!(cfg.max_generate_retries, 10);
        assert_eq!(cfg.parent_job_retries, 10);
        assert_eq!(cfg.parent_worker_concurrency, 1);
        assert_eq!(cfg.parent_debounce, Duration::from_secs(60));
        assert_eq!(cfg.parent_wave_batch_size, 1);
        assert_eq!(cfg.parent_leaf_batch_size, 10_000);
        // Cascade depth is capped by the leaf zoom.
        assert_eq!(cfg.parent_cascade_depth, 6);
    }

    #[test]
    fn blank_prompt_is_rejected() {
        let input = BatchRunInput::new(20, 20, 6, 64, 64, "   \n ");
        assert!(matches!(input.normalize(), Err(BatchError::Config(_))));
    }

    #[test]
    fn bad_map_dimensions_are_rejected() {
        let input = BatchRunInput::new(20, 20, 6, 0, 64, "prompt");
        assert!(matches!(input.normalize(), Err(BatchError::Config(_))));
    }

    #[test]
    fn escalation_ladder() {
        assert_eq!(ModelVariant::FlashPreview.escalate(), ModelVariant::Standard);
        assert_eq!(ModelVariant::Standard.escalate(), ModelVariant::Pro);
        assert_eq!(ModelVariant::Pro.escalate(), ModelVariant::Pro);
    }
}
