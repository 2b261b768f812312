//! Per-anchor execution with retry and backoff
//!
//! The runner wraps the pluggable [`AnchorExecutor`] collaborator with retry,
//! exponential backoff honoring an explicit retry-after hint, and
//! cancellation. It never touches tile data itself.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::anchor::Anchor;
use crate::cancellation::{sleep_cancellable, CancelToken};
use crate::error::BatchError;

/// Context passed to each execution attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancellation signal the collaborator must honor
    pub signal: CancelToken,
}

/// Failure of one anchor execution attempt
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AnchorExecError {
    pub message: String,
    /// Backoff hint, e.g. from a rate-limited generator
    pub retry_after: Option<Duration>,
}

impl AnchorExecError {
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

/// Executes one 3x3 anchor edit.
///
/// Must be idempotent per `(anchor id, attempt)` and honor the context
/// signal. The scheduler owns no tile I/O; all of it happens behind this
/// seam.
#[async_trait]
pub trait AnchorExecutor: Send + Sync {
    async fn execute_anchor(
        &self,
        anchor: &Anchor,
        ctx: &AttemptContext,
    ) -> Result<(), AnchorExecError>;
}

/// Terminal outcome of running one anchor through all its attempts
#[derive(Debug, Clone)]
pub(crate) enum AnchorOutcome {
    Success {
        attempts: u32,
    },
    Failed {
        message: String,
        attempts: u32,
    },
    /// The signal fired; not recorded as a task failure
    Cancelled {
        attempts: u32,
    },
    /// Programming or configuration error that must fail the whole run
    Fatal {
        error: BatchError,
        attempts: u32,
    },
}

/// Exponential backoff for retries: 500ms doubling, capped at 15s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = 500u64.saturating_mul(1 << exp);
    Duration::from_millis(ms.min(15_000))
}

/// Drives a single anchor through its retry loop.
pub(crate) struct AnchorRunner {
    executor: Option<Arc<dyn AnchorExecutor>>,
    max_retries: u32,
    signal: CancelToken,
}

impl AnchorRunner {
    pub fn new(
        executor: Option<Arc<dyn AnchorExecutor>>,
        max_retries: u32,
        signal: CancelToken,
    ) -> Self {
        Self {
            executor,
            max_retries,
            signal,
        }
    }

    pub async fn run(&self, anchor: &Anchor) -> AnchorOutcome {
        let Some(executor) = &self.executor else {
            return AnchorOutcome::Fatal {
                error: BatchError::CollaboratorMissing("execute_anchor".to_string()),
                attempts: 0,
            };
        };

        let max_attempts = self.max_retries + 1;
        let mut attempt = 1;
        loop {
            if self.signal.is_cancelled() {
                return AnchorOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            let ctx = AttemptContext {
                attempt,
                signal: self.signal.clone(),
            };
            match executor.execute_anchor(anchor, &ctx).await {
                Ok(()) => return AnchorOutcome::Success { attempts: attempt },
                Err(err) => {
                    if self.signal.is_cancelled() {
                        return AnchorOutcome::Cancelled { attempts: attempt };
                    }
                    if attempt >= max_attempts {
                        return AnchorOutcome::Failed {
                            message: err.message,
                            attempts: attempt,
                        };
                    }
                    let delay = err.retry_after.unwrap_or_else(|| backoff_delay(attempt));
                    debug!(
                        anchor = %anchor.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "anchor attempt failed, retrying"
                    );
                    if sleep_cancellable(delay, &self.signal).await.is_err() {
                        return AnchorOutcome::Cancelled { attempts: attempt };
                    }
                    attempt += 1;
                }
            }
        }
    }
}
