//! Batch run engine
//!
//! One [`start_batch_run`] call owns a plan of anchors and drives them to
//! completion: overlap-safe wave scheduling, retrying anchor execution,
//! blocked propagation on failure, dirty-leaf aggregation, and a parent
//! worker pool cascading pyramid refreshes upward. All state mutations funnel
//! through a single serialization point; child tasks do the I/O and report
//! back.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use chrono::Utc;

use crate::anchor::{AnchorId, AnchorStatus};
use crate::cancellation::{sleep_cancellable, CancelToken};
use crate::config::{BatchConfig, BatchRunInput, SchedulingMode};
use crate::error::{BatchError, BatchResult};
use crate::parents::{
    ParentJobStatus, ParentLevelRequest, ParentRefreshJob, ParentRefresher,
    DirtyParentAggregator,
};
use crate::plan::{build_plan, BatchPlan};
use crate::runner::{backoff_delay, AnchorExecutor, AnchorOutcome, AnchorRunner};
use crate::state::{
    BatchRunState, GenerateProgress, ParentProgress, RunId, RunStatus, StateObserver, Wave,
};
use crate::tile::TileCoord;

/// Poll interval for parent workers when nothing is runnable
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Handle to an in-flight batch run
pub struct BatchRunHandle {
    run_id: RunId,
    snapshot: Arc<RwLock<BatchRunState>>,
    signal: CancelToken,
    done: oneshot::Receiver<BatchRunState>,
}

impl BatchRunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// A deep-copied snapshot of the current run state.
    pub fn state(&self) -> BatchRunState {
        self.snapshot.read().clone()
    }

    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    /// The run's cancellation token, for wiring into collaborators.
    pub fn signal(&self) -> CancelToken {
        self.signal.clone()
    }

    /// Wait for the run to finish and return the final state.
    ///
    /// Cancellation and anchor failures resolve normally (status CANCELLED
    /// resp. COMPLETED); only a dropped engine task yields an error.
    pub async fn done(self) -> BatchResult<BatchRunState> {
        self.done
            .await
            .map_err(|_| BatchError::Internal("batch engine task dropped".to_string()))
    }
}

/// Start a batch run. Must be called from within a Tokio runtime.
pub fn start_batch_run(input: BatchRunInput) -> BatchResult<BatchRunHandle> {
    let config = Arc::new(input.normalize()?);
    let BatchRunInput {
        signal,
        on_state,
        execute_anchor,
        refresh_parent_level,
        ..
    } = input;
    let signal = signal.unwrap_or_default();

    let plan = build_plan(config.origin, config.layers, config.bounds);
    let run_id = RunId::new();
    info!(
        %run_id,
        anchors = plan.len(),
        mode = ?config.scheduling_mode,
        max_parallel = config.max_parallel,
        "starting batch run"
    );

    let core = RunCore::new(run_id, config.clone(), plan);
    let snapshot = Arc::new(RwLock::new(core.snapshot()));
    let engine = Arc::new(Engine {
        config,
        core: Mutex::new(core),
        snapshot: snapshot.clone(),
        observer: on_state,
        signal: signal.clone(),
        executor: execute_anchor,
        refresher: refresh_parent_level,
    });

    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(engine.drive(done_tx));

    Ok(BatchRunHandle {
        run_id,
        snapshot,
        signal,
        done: done_rx,
    })
}

/// Completion report from a spawned anchor runner
struct AnchorEvent {
    id: AnchorId,
    outcome: AnchorOutcome,
}

/// A parent job claimed by a worker
#[derive(Clone)]
struct ClaimedJob {
    id: u64,
    child_z: u32,
    leaves: Vec<TileCoord>,
    max_levels: u32,
}

enum ParentJobError {
    Cancelled,
    Exhausted(String),
}

struct Engine {
    config: Arc<BatchConfig>,
    core: Mutex<RunCore>,
    snapshot: Arc<RwLock<BatchRunState>>,
    observer: Option<Arc<dyn StateObserver>>,
    signal: CancelToken,
    executor: Option<Arc<dyn AnchorExecutor>>,
    refresher: Option<Arc<dyn ParentRefresher>>,
}

impl Engine {
    /// Publish a snapshot while the core lock is held, keeping the snapshot
    /// sequence totally ordered.
    fn emit_locked(&self, core: &RunCore) {
        let snap = core.snapshot();
        *self.snapshot.write() = snap.clone();
        if let Some(observer) = &self.observer {
            observer.on_state(snap);
        }
    }

    /// Mutate the core and publish a snapshot.
    fn with_core<R>(&self, f: impl FnOnce(&mut RunCore) -> R) -> R {
        let mut core = self.core.lock();
        let out = f(&mut core);
        self.emit_locked(&core);
        out
    }

    /// Mutate the core; publish a snapshot only when the closure reports a
    /// change.
    fn mutate_if<R>(&self, f: impl FnOnce(&mut RunCore) -> (R, bool)) -> R {
        let mut core = self.core.lock();
        let (out, changed) = f(&mut core);
        if changed {
            self.emit_locked(&core);
        }
        out
    }

    async fn drive(self: Arc<Self>, done_tx: oneshot::Sender<BatchRunState>) {
        // Initial snapshot.
        {
            let core = self.core.lock();
            self.emit_locked(&core);
        }

        let empty = self.core.lock().anchors_empty();
        if empty {
            let final_state = self.with_core(|core| {
                core.generation_done = true;
                core.catch_up_settled = true;
                core.status = RunStatus::Completed;
                core.snapshot()
            });
            info!(run_id = %final_state.run_id, "empty plan, run completed immediately");
            let _ = done_tx.send(final_state);
            return;
        }

        let workers: Vec<_> = (0..self.config.parent_worker_concurrency)
            .map(|idx| tokio::spawn(self.clone().parent_worker(idx)))
            .collect();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        match self.config.scheduling_mode {
            SchedulingMode::WaveBarrier => {
                self.run_wave_barrier(&events_tx, &mut events_rx).await;
            }
            SchedulingMode::RollingFill => {
                self.run_rolling_fill(&events_tx, &mut events_rx).await;
            }
        }

        // Generation phase over: flush whatever is still dirty and let the
        // workers drain the queue and emit the final catch-up.
        let cancelled = self.signal.is_cancelled();
        self.with_core(|core| {
            core.generation_done = true;
            if core.status == RunStatus::Running {
                core.status = RunStatus::Completing;
            }
            if !cancelled {
                core.flush_dirty(true);
            }
        });

        let _ = futures::future::join_all(workers).await;

        let final_state = self.with_core(|core| {
            core.status = if core.fatal.is_some() {
                core.error = core.fatal.clone();
                RunStatus::Failed
            } else if self.signal.is_cancelled() {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            };
            core.snapshot()
        });
        info!(
            run_id = %final_state.run_id,
            status = ?final_state.status,
            waves = final_state.waves.len(),
            "batch run finished"
        );
        let _ = done_tx.send(final_state);
    }

    fn spawn_anchor(&self, id: AnchorId, events_tx: &mpsc::UnboundedSender<AnchorEvent>) {
        let anchor = {
            let core = self.core.lock();
            core.plan.anchors.get(&id).cloned()
        };
        let Some(anchor) = anchor else {
            // Unknown id here is an engine bug; surface it as a fatal event.
            let _ = events_tx.send(AnchorEvent {
                id,
                outcome: AnchorOutcome::Fatal {
                    error: BatchError::UnknownAnchor(id.to_string()),
                    attempts: 0,
                },
            });
            return;
        };
        let runner = AnchorRunner::new(
            self.executor.clone(),
            self.config.max_generate_retries,
            self.signal.clone(),
        );
        let tx = events_tx.clone();
        tokio::spawn(async move {
            let outcome = runner.run(&anchor).await;
            let _ = tx.send(AnchorEvent {
                id: anchor.id,
                outcome,
            });
        });
    }

    /// Wave-barrier generation: start a wave, wait for every anchor in it,
    /// repeat.
    async fn run_wave_barrier(
        &self,
        events_tx: &mpsc::UnboundedSender<AnchorEvent>,
        events_rx: &mut mpsc::UnboundedReceiver<AnchorEvent>,
    ) {
        loop {
            if self.signal.is_cancelled() {
                break;
            }
            let wave = self.mutate_if(|core| {
                let blocked = core.block_anchors_with_dead_deps();
                let picked = core.pick_ready(core.config.max_parallel);
                if picked.is_empty() {
                    if core.has_pending() {
                        core.force_block_stranded();
                        (None, true)
                    } else {
                        (None, blocked)
                    }
                } else {
                    let index = core.begin_wave(&picked);
                    debug!(wave = index, anchors = picked.len(), "starting wave");
                    (Some((index, picked)), true)
                }
            });
            let Some((wave_index, ids)) = wave else {
                break;
            };

            for id in &ids {
                self.spawn_anchor(*id, events_tx);
            }

            let mut remaining = ids.len();
            while remaining > 0 {
                let Some(event) = events_rx.recv().await else {
                    break;
                };
                let fatal = self.with_core(|core| core.apply_event(&event, Some(wave_index)));
                if fatal {
                    self.signal.cancel();
                }
                remaining -= 1;
            }

            self.with_core(|core| {
                core.finish_wave(wave_index);
                core.flush_dirty(false);
            });
        }
    }

    /// Rolling-fill generation: refill free slots on every completion; each
    /// completion produces its own single-anchor wave record.
    async fn run_rolling_fill(
        &self,
        events_tx: &mpsc::UnboundedSender<AnchorEvent>,
        events_rx: &mut mpsc::UnboundedReceiver<AnchorEvent>,
    ) {
        let mut in_flight = 0usize;
        loop {
            if !self.signal.is_cancelled() {
                let started = self.mutate_if(|core| {
                    let blocked = core.block_anchors_with_dead_deps();
                    let free = core.config.max_parallel.saturating_sub(core.running.len());
                    let picked = core.pick_ready(free);
                    for id in &picked {
                        core.start_anchor(*id, None);
                    }
                    let changed = blocked || !picked.is_empty();
                    (picked, changed)
                });
                for id in &started {
                    self.spawn_anchor(*id, events_tx);
                }
                in_flight += started.len();
            }

            if in_flight == 0 {
                if self.signal.is_cancelled() {
                    break;
                }
                let finished = self.mutate_if(|core| {
                    if core.has_pending() {
                        // Nothing running and nothing startable: the rest is
                        // unreachable.
                        core.force_block_stranded();
                        (true, true)
                    } else {
                        (true, false)
                    }
                });
                if finished {
                    break;
                }
            }

            let Some(event) = events_rx.recv().await else {
                break;
            };
            in_flight -= 1;
            let fatal = self.with_core(|core| {
                let fatal = core.apply_event(&event, None);
                core.flush_dirty(false);
                fatal
            });
            if fatal {
                self.signal.cancel();
            }
        }
    }

    /// Parent worker loop: drain queued jobs, cascade each upward, trigger
    /// time-based flushes and the final catch-up while idle.
    async fn parent_worker(self: Arc<Self>, worker: usize) {
        debug!(worker, "parent worker started");
        loop {
            if self.signal.is_cancelled() {
                break;
            }

            let claimed = self.mutate_if(|core| {
                let job = core.claim_queued_job();
                let changed = job.is_some();
                (job, changed)
            });

            if let Some(job) = claimed {
                match self.run_parent_job(&job).await {
                    Ok(()) => {
                        self.with_core(|core| core.complete_job(job.id));
                    }
                    Err(ParentJobError::Cancelled) => {
                        self.with_core(|core| core.requeue_job(job.id));
                        break;
                    }
                    Err(ParentJobError::Exhausted(message)) => {
                        warn!(job = job.id, error = %message, "parent refresh job failed permanently");
                        self.with_core(|core| core.fail_job(job.id, message));
                        self.signal.cancel();
                        break;
                    }
                }
                continue;
            }

            // Idle: time-based flush, then the final catch-up, then exit
            // check.
            let (may_exit, acted) = self.mutate_if(|core| {
                let mut acted = core.flush_dirty(false);
                acted |= core.try_final_catch_up();
                ((core.workers_may_exit(), acted), acted)
            });
            if acted {
                continue;
            }
            if may_exit {
                break;
            }
            if sleep_cancellable(WORKER_POLL_INTERVAL, &self.signal)
                .await
                .is_err()
            {
                break;
            }
        }
        debug!(worker, "parent worker exited");
    }

    /// Run one parent job to completion with retries; inside a job the
    /// refresh cascades upward one zoom level at a time.
    async fn run_parent_job(&self, job: &ClaimedJob) -> Result<(), ParentJobError> {
        let Some(refresher) = self.refresher.clone() else {
            return Err(ParentJobError::Exhausted(
                BatchError::CollaboratorMissing("refresh_parent_level".to_string()).to_string(),
            ));
        };

        let max_attempts = self.config.parent_job_retries + 1;
        let mut attempt = 1;
        loop {
            if self.signal.is_cancelled() {
                return Err(ParentJobError::Cancelled);
            }
            self.with_core(|core| core.record_job_attempt(job.id, attempt));

            match self.cascade(&refresher, job).await {
                Ok(()) => return Ok(()),
                Err(ParentJobError::Cancelled) => return Err(ParentJobError::Cancelled),
                Err(ParentJobError::Exhausted(message)) => {
                    if attempt >= max_attempts {
                        return Err(ParentJobError::Exhausted(message));
                    }
                    let delay = self
                        .peek_retry_after(job.id)
                        .unwrap_or_else(|| backoff_delay(attempt));
                    debug!(
                        job = job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "parent refresh attempt failed, retrying"
                    );
                    if sleep_cancellable(delay, &self.signal).await.is_err() {
                        return Err(ParentJobError::Cancelled);
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn peek_retry_after(&self, job_id: u64) -> Option<Duration> {
        self.core.lock().take_retry_hint(job_id)
    }

    async fn cascade(
        &self,
        refresher: &Arc<dyn ParentRefresher>,
        job: &ClaimedJob,
    ) -> Result<(), ParentJobError> {
        let mut child_z = job.child_z;
        let mut tiles = job.leaves.clone();
        let mut levels_done = 0u32;

        while child_z > 0 && !tiles.is_empty() && levels_done < job.max_levels {
            if self.signal.is_cancelled() {
                return Err(ParentJobError::Cancelled);
            }
            self.with_core(|core| core.set_job_level(job.id, child_z));

            let request = ParentLevelRequest {
                child_z,
                child_tiles: tiles.clone(),
                signal: self.signal.clone(),
            };
            match refresher.refresh_parent_level(&request).await {
                Ok(parents) => {
                    let mut next: Vec<TileCoord> = parents;
                    next.sort();
                    next.dedup();
                    tiles = next;
                    child_z -= 1;
                    levels_done += 1;
                }
                Err(err) => {
                    if self.signal.is_cancelled() {
                        return Err(ParentJobError::Cancelled);
                    }
                    self.core.lock().stash_retry_hint(job.id, err.retry_after);
                    return Err(ParentJobError::Exhausted(err.message));
                }
            }
        }
        Ok(())
    }
}

/// All mutable run state, owned behind the engine's serialization point.
struct RunCore {
    run_id: RunId,
    config: Arc<BatchConfig>,
    status: RunStatus,
    plan: BatchPlan,
    running: HashSet<AnchorId>,
    waves: Vec<Wave>,
    parent_jobs: Vec<ParentRefreshJob>,
    aggregator: DirtyParentAggregator,
    next_job_id: u64,
    generation_done: bool,
    catch_up_settled: bool,
    fatal: Option<String>,
    error: Option<String>,
    /// Retry-after hint from the last failed refresh call per job
    retry_hints: Vec<(u64, Duration)>,
}

impl RunCore {
    fn new(run_id: RunId, config: Arc<BatchConfig>, plan: BatchPlan) -> Self {
        let aggregator = DirtyParentAggregator::new(
            config.parent_debounce,
            config.parent_wave_batch_size,
            config.parent_leaf_batch_size,
        );
        Self {
            run_id,
            config,
            status: RunStatus::Running,
            plan,
            running: HashSet::new(),
            waves: Vec::new(),
            parent_jobs: Vec::new(),
            aggregator,
            next_job_id: 1,
            generation_done: false,
            catch_up_settled: false,
            fatal: None,
            error: None,
            retry_hints: Vec::new(),
        }
    }

    fn anchors_empty(&self) -> bool {
        self.plan.is_empty()
    }

    fn has_pending(&self) -> bool {
        self.plan
            .anchors
            .values()
            .any(|a| a.status == AnchorStatus::Pending)
    }

    fn snapshot(&self) -> BatchRunState {
        let waves_completed = self.waves.iter().filter(|w| w.finished_at.is_some()).count();
        BatchRunState {
            run_id: self.run_id,
            status: self.status,
            origin: self.config.origin,
            layers: self.config.layers,
            max_parallel: self.config.max_parallel,
            anchors: self.plan.anchors.clone(),
            waves: self.waves.clone(),
            parent_jobs: self.parent_jobs.clone(),
            generate: GenerateProgress::from_anchors(&self.plan.anchors, waves_completed),
            parents: ParentProgress::from_jobs(&self.parent_jobs),
            coverage: self.plan.coverage,
            error: self.error.clone().or_else(|| self.fatal.clone()),
        }
    }

    /// READY = PENDING with every dependency SUCCESS. Greedily pick up to
    /// `cap` ready anchors in priority order, skipping any that overlap an
    /// already-picked or currently running anchor.
    fn pick_ready(&self, cap: usize) -> Vec<AnchorId> {
        let mut picked: Vec<AnchorId> = Vec::new();
        if cap == 0 {
            return picked;
        }
        for id in &self.plan.priority_order {
            if picked.len() >= cap {
                break;
            }
            let anchor = &self.plan.anchors[id];
            if anchor.status != AnchorStatus::Pending {
                continue;
            }
            let deps_ready = anchor
                .deps
                .iter()
                .all(|d| self.plan.anchors[d].status == AnchorStatus::Success);
            if !deps_ready {
                continue;
            }
            let conflict = self
                .running
                .iter()
                .chain(picked.iter())
                .any(|other| anchor.conflicts_with(&self.plan.anchors[other]));
            if conflict {
                continue;
            }
            picked.push(*id);
        }
        picked
    }

    /// Eager propagation: a PENDING anchor whose dependency is FAILED or
    /// BLOCKED can never run. Returns whether anything was blocked.
    fn block_anchors_with_dead_deps(&mut self) -> bool {
        let mut any = false;
        loop {
            let mut newly_blocked: Vec<(AnchorId, AnchorId)> = Vec::new();
            for anchor in self.plan.anchors.values() {
                if anchor.status != AnchorStatus::Pending {
                    continue;
                }
                for dep in &anchor.deps {
                    let dep_status = self.plan.anchors[dep].status;
                    if matches!(dep_status, AnchorStatus::Failed | AnchorStatus::Blocked) {
                        newly_blocked.push((anchor.id, *dep));
                        break;
                    }
                }
            }
            if newly_blocked.is_empty() {
                return any;
            }
            any = true;
            for (id, dep) in newly_blocked {
                let originator = self.plan.anchors[&dep].blocked_by.unwrap_or(dep);
                if let Some(anchor) = self.plan.anchors.get_mut(&id) {
                    anchor.mark_blocked(Some(originator));
                }
            }
        }
    }

    /// Safety net: when no anchor is ready, none running, but PENDING
    /// remain, force-block them. Unreachable under correct eager
    /// propagation.
    fn force_block_stranded(&mut self) {
        let stranded: Vec<AnchorId> = self
            .plan
            .anchors
            .values()
            .filter(|a| a.status == AnchorStatus::Pending)
            .map(|a| a.id)
            .collect();
        if !stranded.is_empty() {
            warn!(count = stranded.len(), "force-blocking stranded anchors");
        }
        for id in stranded {
            let blocker = self.plan.anchors[&id]
                .deps
                .iter()
                .find(|d| self.plan.anchors[*d].status != AnchorStatus::Success)
                .copied();
            if let Some(anchor) = self.plan.anchors.get_mut(&id) {
                anchor.mark_blocked(blocker);
            }
        }
    }

    fn start_anchor(&mut self, id: AnchorId, wave: Option<u32>) {
        if let Some(anchor) = self.plan.anchors.get_mut(&id) {
            anchor.mark_running(wave, Utc::now());
            self.running.insert(id);
        }
    }

    /// Start a wave of anchors and append its record. Returns the wave
    /// index.
    fn begin_wave(&mut self, ids: &[AnchorId]) -> u32 {
        let index = self.waves.len() as u32 + 1;
        for id in ids {
            self.start_anchor(*id, Some(index));
        }
        self.waves.push(Wave {
            index,
            task_ids: ids.to_vec(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        });
        index
    }

    fn finish_wave(&mut self, index: u32) {
        if let Some(wave) = self.waves.get_mut(index as usize - 1) {
            wave.finished_at = Some(Utc::now());
            if !wave.succeeded.is_empty() {
                self.aggregator.note_wave();
            }
        }
    }

    /// Apply one runner completion. In barrier mode the enclosing wave is
    /// passed in; in rolling mode a fresh single-anchor wave record is
    /// created. Returns whether a fatal error was recorded.
    fn apply_event(&mut self, event: &AnchorEvent, wave: Option<u32>) -> bool {
        let now = Utc::now();

        // Cancellation is not a completion: the anchor goes back to PENDING
        // and no wave record is minted for it.
        if let AnchorOutcome::Cancelled { attempts } = &event.outcome {
            self.running.remove(&event.id);
            if let Some(anchor) = self.plan.anchors.get_mut(&event.id) {
                anchor.revert_to_pending(*attempts);
            }
            return false;
        }

        // Rolling-mode wave records are closed at creation: the record is
        // the completion event itself.
        let wave_index = wave.unwrap_or_else(|| {
            let index = self.waves.len() as u32 + 1;
            self.waves.push(Wave {
                index,
                task_ids: vec![event.id],
                succeeded: Vec::new(),
                failed: Vec::new(),
                blocked: Vec::new(),
                started_at: now,
                finished_at: Some(now),
            });
            index
        });

        self.running.remove(&event.id);
        let mut fatal = false;
        match &event.outcome {
            AnchorOutcome::Success { attempts } => {
                if let Some(anchor) = self.plan.anchors.get_mut(&event.id) {
                    anchor.mark_success(*attempts, now);
                    if wave.is_none() {
                        anchor.wave = Some(wave_index);
                    }
                }
                let center = self.plan.anchors[&event.id].center();
                self.aggregator
                    .mark_footprint(center, self.config.bounds, Instant::now());
                self.wave_mut(wave_index).succeeded.push(event.id);
            }
            AnchorOutcome::Failed { message, attempts } => {
                if let Some(anchor) = self.plan.anchors.get_mut(&event.id) {
                    anchor.mark_failed(message.clone(), *attempts, now);
                    if wave.is_none() {
                        anchor.wave = Some(wave_index);
                    }
                }
                debug!(anchor = %event.id, error = %message, "anchor failed");
                self.wave_mut(wave_index).failed.push(event.id);
                let blocked = self.propagate_blocked(event.id);
                self.wave_mut(wave_index).blocked.extend(blocked);
            }
            // Handled above.
            AnchorOutcome::Cancelled { .. } => {}
            AnchorOutcome::Fatal { error, attempts } => {
                if let Some(anchor) = self.plan.anchors.get_mut(&event.id) {
                    anchor.mark_failed(error.to_string(), *attempts, now);
                    if wave.is_none() {
                        anchor.wave = Some(wave_index);
                    }
                }
                self.wave_mut(wave_index).failed.push(event.id);
                if self.fatal.is_none() {
                    self.fatal = Some(error.to_string());
                }
                fatal = true;
            }
        }

        // A rolling-mode wave that carried a success still counts toward
        // parent wave batching.
        if wave.is_none() && matches!(event.outcome, AnchorOutcome::Success { .. }) {
            self.aggregator.note_wave();
        }
        fatal
    }

    fn wave_mut(&mut self, index: u32) -> &mut Wave {
        // Wave indices are 1-based and dense.
        &mut self.waves[index as usize - 1]
    }

    /// Breadth-first over reverse edges: every still-PENDING transitive
    /// dependent of a failed anchor becomes BLOCKED.
    fn propagate_blocked(&mut self, failed: AnchorId) -> Vec<AnchorId> {
        let mut blocked = Vec::new();
        let mut queue: VecDeque<AnchorId> = self.plan.anchors[&failed]
            .dependents
            .iter()
            .copied()
            .collect();
        while let Some(id) = queue.pop_front() {
            let Some(anchor) = self.plan.anchors.get_mut(&id) else {
                continue;
            };
            if anchor.status != AnchorStatus::Pending {
                continue;
            }
            anchor.mark_blocked(Some(failed));
            blocked.push(id);
            let dependents = self.plan.anchors[&id].dependents.clone();
            queue.extend(dependents);
        }
        blocked
    }

    /// Flush the dirty set into a queued parent job. `force` flushes
    /// regardless of policy (generation finished).
    fn flush_dirty(&mut self, force: bool) -> bool {
        let leaves = if force {
            self.aggregator.flush()
        } else {
            self.aggregator.flush_if_due(Instant::now())
        };
        match leaves {
            Some(leaves) => {
                let depth = self.config.parent_cascade_depth;
                self.enqueue_parent_job(leaves, depth);
                true
            }
            None => false,
        }
    }

    fn enqueue_parent_job(&mut self, leaves: Vec<TileCoord>, max_levels: u32) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        debug!(job = id, leaves = leaves.len(), max_levels, "queued parent refresh job");
        self.parent_jobs.push(ParentRefreshJob::new(
            id,
            self.config.leaf_z,
            leaves,
            max_levels,
        ));
        id
    }

    fn jobs_outstanding(&self) -> bool {
        self.parent_jobs.iter().any(|j| {
            matches!(j.status, ParentJobStatus::Queued | ParentJobStatus::Running)
        })
    }

    /// Emit the once-per-run catch-up job over the cumulative touched set so
    /// every ancestor level gets refreshed. Skipped when regular cascades
    /// already reach the root.
    fn try_final_catch_up(&mut self) -> bool {
        if self.catch_up_settled || !self.generation_done || self.jobs_outstanding() {
            return false;
        }
        self.catch_up_settled = true;
        if self.config.parent_cascade_depth >= self.config.leaf_z {
            debug!("final catch-up pre-satisfied by cascade depth");
            return false;
        }
        let touched = self.aggregator.take_touched();
        if touched.is_empty() {
            return false;
        }
        let max_levels = self.config.leaf_z;
        self.enqueue_parent_job(touched, max_levels);
        true
    }

    fn workers_may_exit(&self) -> bool {
        self.generation_done && !self.jobs_outstanding() && self.catch_up_settled
    }

    fn claim_queued_job(&mut self) -> Option<ClaimedJob> {
        let job = self
            .parent_jobs
            .iter_mut()
            .find(|j| j.status == ParentJobStatus::Queued)?;
        job.status = ParentJobStatus::Running;
        job.current_level = Some(job.child_z);
        Some(ClaimedJob {
            id: job.id,
            child_z: job.child_z,
            leaves: job.leaves.clone(),
            max_levels: job.max_levels,
        })
    }

    fn job_mut(&mut self, id: u64) -> Option<&mut ParentRefreshJob> {
        self.parent_jobs.iter_mut().find(|j| j.id == id)
    }

    fn record_job_attempt(&mut self, id: u64, attempt: u32) {
        if let Some(job) = self.job_mut(id) {
            job.attempts = attempt;
        }
    }

    fn set_job_level(&mut self, id: u64, level: u32) {
        if let Some(job) = self.job_mut(id) {
            job.current_level = Some(level);
        }
    }

    fn complete_job(&mut self, id: u64) {
        if let Some(job) = self.job_mut(id) {
            job.status = ParentJobStatus::Success;
            job.current_level = None;
        }
    }

    fn fail_job(&mut self, id: u64, message: String) {
        if let Some(job) = self.job_mut(id) {
            job.status = ParentJobStatus::Failed;
            job.current_level = None;
            job.error = Some(message.clone());
        }
        if self.fatal.is_none() {
            self.fatal = Some(message);
        }
    }

    /// Cancellation mid-job: the job goes back to the queue untouched.
    fn requeue_job(&mut self, id: u64) {
        if let Some(job) = self.job_mut(id) {
            job.status = ParentJobStatus::Queued;
            job.current_level = None;
        }
    }

    fn stash_retry_hint(&mut self, id: u64, hint: Option<Duration>) {
        self.retry_hints.retain(|(job, _)| *job != id);
        if let Some(hint) = hint {
            self.retry_hints.push((id, hint));
        }
    }

    fn take_retry_hint(&mut self, id: u64) -> Option<Duration> {
        let pos = self.retry_hints.iter().position(|(job, _)| *job == id)?;
        Some(self.retry_hints.swap_remove(pos).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parents::ParentRefreshError;
    use crate::runner::{AnchorExecError, AttemptContext};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    struct AlwaysOk;

    #[async_trait]
    impl AnchorExecutor for AlwaysOk {
        async fn execute_anchor(
            &self,
            _anchor: &crate::anchor::Anchor,
            _ctx: &AttemptContext,
        ) -> Result<(), AnchorExecError> {
            Ok(())
        }
    }

    struct NoParents;

    #[async_trait]
    impl ParentRefresher for NoParents {
        async fn refresh_parent_level(
            &self,
            _request: &ParentLevelRequest,
        ) -> Result<Vec<TileCoord>, ParentRefreshError> {
            Ok(Vec::new())
        }
    }

    fn basic_input() -> BatchRunInput {
        let mut input = BatchRunInput::new(20, 20, 4, 64, 64, "test prompt");
        input.execute_anchor = Some(Arc::new(AlwaysOk));
        input.refresh_parent_level = Some(Arc::new(NoParents));
        input
    }

    #[tokio::test]
    async fn empty_plan_completes_immediately() {
        let mut input = basic_input();
        input.origin_x = 1000; // outside the map
        let handle = start_batch_run(input).unwrap();
        let state = timeout(Duration::from_secs(5), handle.done())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.anchors.is_empty());
        assert!(state.waves.is_empty());
    }

    #[tokio::test]
    async fn single_anchor_run_completes() {
        let mut input = basic_input();
        input.layers = 0;
        let handle = start_batch_run(input).unwrap();
        let state = timeout(Duration::from_secs(5), handle.done())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.generate.success, 1);
        assert_eq!(state.waves.len(), 1);
        assert_eq!(state.waves[0].index, 1);
        assert_eq!(state.waves[0].task_ids, vec![AnchorId::new(0, 0)]);
    }

    #[tokio::test]
    async fn missing_executor_fails_the_run() {
        let mut input = basic_input();
        input.execute_anchor = None;
        input.layers = 0;
        let handle = start_batch_run(input).unwrap();
        let state = timeout(Duration::from_secs(5), handle.done())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("execute_anchor"));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_spawn() {
        let mut input = basic_input();
        input.prompt = "  ".to_string();
        assert!(start_batch_run(input).is_err());
    }
}
