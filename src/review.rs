//! Human review gate
//!
//! An optional single-consumer FIFO that interposes between preview
//! generation and acceptance. At most one item is active at a time; the
//! consumer resolves the active item with a decision and the next pending
//! item becomes active. Unresolved reviews never time out on their own;
//! timeouts are a caller concern via cancellation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::anchor::{Anchor, AnchorId};
use crate::config::ModelVariant;
use crate::error::{BatchError, BatchResult};
use crate::runner::{AnchorExecError, AnchorExecutor, AttemptContext};

/// Reviewer decision for the active item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Accept,
    Reject,
}

struct ReviewEntry<T> {
    payload: T,
    decision_tx: oneshot::Sender<BatchResult<ReviewDecision>>,
}

struct ReviewQueueInner<T> {
    active: Option<ReviewEntry<T>>,
    pending: VecDeque<ReviewEntry<T>>,
    cancelled: Option<String>,
}

/// Single-active-at-a-time review FIFO
pub struct ReviewQueue<T> {
    inner: Mutex<ReviewQueueInner<T>>,
}

impl<T: Send> ReviewQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ReviewQueueInner {
                active: None,
                pending: VecDeque::new(),
                cancelled: None,
            }),
        }
    }

    /// Enqueue a payload and wait for the consumer's decision.
    ///
    /// The item becomes active immediately when nothing else is active.
    /// Resolves with a cancellation error if the queue is (or becomes)
    /// cancelled.
    pub async fn enqueue(&self, payload: T) -> BatchResult<ReviewDecision> {
        let (decision_tx, decision_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if let Some(reason) = &inner.cancelled {
                return Err(BatchError::Cancelled(reason.clone()));
            }
            let entry = ReviewEntry {
                payload,
                decision_tx,
            };
            if inner.active.is_none() {
                inner.active = Some(entry);
            } else {
                inner.pending.push_back(entry);
            }
        }
        decision_rx
            .await
            .map_err(|_| BatchError::Cancelled("review queue dropped".to_string()))?
    }

    /// The active payload, if any.
    pub fn active(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().active.as_ref().map(|e| e.payload.clone())
    }

    /// Number of items waiting, including the active one.
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending.len() + usize::from(inner.active.is_some())
    }

    /// Resolve the active item; the next pending item becomes active.
    pub fn resolve_active(&self, decision: ReviewDecision) -> BatchResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .active
            .take()
            .ok_or_else(|| BatchError::Review("no active review to resolve".to_string()))?;
        let _ = entry.decision_tx.send(Ok(decision));
        inner.active = inner.pending.pop_front();
        Ok(())
    }

    /// Reject the active and every pending item and refuse future enqueues.
    /// Idempotent.
    pub fn cancel_all(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock();
        if inner.cancelled.is_some() {
            return;
        }
        inner.cancelled = Some(reason.clone());
        if let Some(entry) = inner.active.take() {
            let _ = entry
                .decision_tx
                .send(Err(BatchError::Cancelled(reason.clone())));
        }
        while let Some(entry) = inner.pending.pop_front() {
            let _ = entry
                .decision_tx
                .send(Err(BatchError::Cancelled(reason.clone())));
        }
    }
}

impl<T: Send> Default for ReviewQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// What the reviewer sees for a pending preview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub anchor: AnchorId,
    pub variant: ModelVariant,
    pub attempt: u32,
}

/// Two-phase anchor generation behind a review gate.
///
/// `generate` produces a preview; `commit` makes it live; `discard` throws it
/// away after a rejection.
#[async_trait]
pub trait PreviewGenerator: Send + Sync {
    type Preview: Send;

    async fn generate(
        &self,
        anchor: &Anchor,
        variant: ModelVariant,
        ctx: &AttemptContext,
    ) -> Result<Self::Preview, AnchorExecError>;

    async fn commit(
        &self,
        anchor: &Anchor,
        preview: Self::Preview,
    ) -> Result<(), AnchorExecError>;

    async fn discard(
        &self,
        anchor: &Anchor,
        preview: Self::Preview,
    ) -> Result<(), AnchorExecError>;
}

/// [`AnchorExecutor`] that routes every generated preview through a
/// [`ReviewQueue`], escalating the model variant after each rejection.
pub struct ReviewedExecutor<G> {
    generator: G,
    queue: Arc<ReviewQueue<ReviewRequest>>,
    initial_variant: ModelVariant,
}

impl<G> ReviewedExecutor<G> {
    pub fn new(
        generator: G,
        queue: Arc<ReviewQueue<ReviewRequest>>,
        initial_variant: ModelVariant,
    ) -> Self {
        Self {
            generator,
            queue,
            initial_variant,
        }
    }
}

#[async_trait]
impl<G: PreviewGenerator> AnchorExecutor for ReviewedExecutor<G> {
    async fn execute_anchor(
        &self,
        anchor: &Anchor,
        ctx: &AttemptContext,
    ) -> Result<(), AnchorExecError> {
        let mut variant = self.initial_variant;
        loop {
            let preview = self.generator.generate(anchor, variant, ctx).await?;
            let decision = self
                .queue
                .enqueue(ReviewRequest {
                    anchor: anchor.id,
                    variant,
                    attempt: ctx.attempt,
                })
                .await
                .map_err(|e| AnchorExecError::new(e.to_string()))?;
            match decision {
                ReviewDecision::Accept => {
                    return self.generator.commit(anchor, preview).await;
                }
                ReviewDecision::Reject => {
                    self.generator.discard(anchor, preview).await?;
                    let next = variant.escalate();
                    debug!(anchor = %anchor.id, from = %variant, to = %next, "preview rejected, escalating");
                    variant = next;
                }
            }
        }
    }
}
