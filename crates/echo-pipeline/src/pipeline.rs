// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Pipeline facade: dispatch surface, scheduling authority, completion path.
//!
//! All bookkeeping (context builder, scheduler, reorder buffer, write-back,
//! retention) lives behind one mutex. Critical sections never await:
//! handlers run on detached tokio tasks spawned after the lock is released,
//! and report back through [`ExecutionSink`].
//!
//! Every state change that can unblock pending work (an enqueue, a release, a
//! cancellation) re-runs the scheduler's issue loop before the lock is
//! dropped. The periodic safety tick is a fallback only.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::catalogue::Catalogue;
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::config::{ConfigError, PipelineConfig};
use crate::context::{BatchItem, ContextBuilder, DispatchOptions};
use crate::error::{HandlerError, PipelineError};
use crate::executor::{self, ExecutionResult, ExecutionSink, Launch};
use crate::ident::{BatchId, InstructionId};
use crate::instruction::{BatchMode, Instruction, InstructionRecord, InstructionStatus, Outcome};
use crate::reorder::{BatchOutcome, BatchProgress, ReadySet, ReorderBuffer};
use crate::retention::RetiredLog;
use crate::scheduler::{Blocked, Scheduler};
use crate::telemetry::{EventBus, PipelineEvent};
use crate::writeback::WriteBack;

/// Read-only counters for observability tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    /// Instructions waiting to issue.
    pub pending_count: usize,
    /// Instructions in `Issued`/`Executing`.
    pub active_count: usize,
    /// Batch members parked in the reorder buffer.
    pub parked_count: usize,
    /// Batches not yet settled.
    pub open_batches: usize,
    /// Locked resource ids.
    pub locked_resources: usize,
    /// Instructions written back as `Committed`.
    pub committed_total: u64,
    /// Instructions written back as `Failed`.
    pub failed_total: u64,
}

/// Handle to a standalone instruction's outcome.
///
/// Resolves exactly once, on write-back.
#[derive(Debug)]
pub struct Ticket {
    id: Option<InstructionId>,
    rx: oneshot::Receiver<Outcome>,
}

impl Ticket {
    /// Id of the dispatched instruction; `None` when dispatch was refused
    /// (unknown type) and the ticket is already settled.
    pub fn id(&self) -> Option<InstructionId> {
        self.id
    }
}

impl Future for Ticket {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(PipelineError::Closed)))
    }
}

/// Handle to a batch's outcome.
///
/// Resolves once every member has been written back.
#[derive(Debug)]
pub struct BatchTicket {
    batch: Option<BatchId>,
    members: Vec<InstructionId>,
    rx: oneshot::Receiver<BatchOutcome>,
}

impl BatchTicket {
    /// Batch id; `None` for an empty or refused batch.
    pub fn batch(&self) -> Option<BatchId> {
        self.batch
    }

    /// Member ids in sequence order.
    pub fn members(&self) -> &[InstructionId] {
        &self.members
    }
}

impl Future for BatchTicket {
    type Output = BatchOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(PipelineError::Closed)))
    }
}

/// Instruction pipeline.
///
/// Cheap to clone; clones share one scheduling authority. Handlers run on
/// the tokio runtime of the calling context. Work issued where no runtime is
/// available fails with [`HandlerError::NoRuntime`] instead of running.
#[derive(Debug, Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    core: Mutex<Core>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

#[derive(Debug)]
struct Core {
    builder: ContextBuilder,
    scheduler: Scheduler,
    reorder: ReorderBuffer,
    writeback: WriteBack,
    retired: RetiredLog,
}

impl Pipeline {
    /// Creates a pipeline over `catalogue` using wall-clock timestamps.
    pub fn new(catalogue: Catalogue, config: PipelineConfig) -> Result<Self, ConfigError> {
        Self::with_clock(catalogue, config, Arc::new(SystemClock))
    }

    /// Creates a pipeline with an injected clock.
    pub fn with_clock(
        catalogue: Catalogue,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            cap = config.concurrency_cap,
            operations = catalogue.len(),
            "pipeline created"
        );
        let core = Core {
            builder: ContextBuilder::new(Arc::new(catalogue), Arc::clone(&clock)),
            scheduler: Scheduler::new(config.concurrency_cap),
            reorder: ReorderBuffer::new(),
            writeback: WriteBack::default(),
            retired: RetiredLog::new(config.retention_capacity, config.retention_ms),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                events: EventBus::new(config.event_capacity),
                clock,
                config,
            }),
        })
    }

    /// Dispatches a standalone instruction submitted by a user.
    pub fn dispatch(&self, kind: &str, payload: Value) -> Ticket {
        self.dispatch_with(kind, payload, DispatchOptions::default())
    }

    /// Dispatches a standalone instruction.
    ///
    /// Never fails synchronously: an unknown type, or a resource function
    /// that panics, yields a ticket that is already settled with
    /// [`PipelineError::UnknownOperation`] or
    /// [`PipelineError::ResourcesUnavailable`].
    #[instrument(skip(self, payload, options), fields(source = ?options.source))]
    pub fn dispatch_with(&self, kind: &str, payload: Value, options: DispatchOptions) -> Ticket {
        let (tx, rx) = oneshot::channel();
        let mut core = self.shared.lock();
        let instruction = match core.builder.build_single(kind, payload, &options) {
            Ok(instruction) => instruction,
            Err(err) => {
                drop(core);
                warn!(%err, "dispatch refused");
                settle_now(tx, Err(err));
                return Ticket { id: None, rx };
            }
        };
        let id = instruction.id;
        let launches = self.shared.admit(&mut core, instruction, Some(tx));
        drop(core);
        self.shared.launch(launches);
        Ticket { id: Some(id), rx }
    }

    /// Dispatches a user batch.
    pub fn dispatch_batch(&self, items: Vec<BatchItem>, mode: BatchMode) -> BatchTicket {
        self.dispatch_batch_with(items, mode, DispatchOptions::default())
    }

    /// Dispatches a batch whose members share one batch id and commit mode.
    ///
    /// An unknown type in any item refuses the whole batch. An empty batch
    /// settles immediately with no outcomes.
    #[instrument(skip(self, items, options), fields(items = items.len()))]
    pub fn dispatch_batch_with(
        &self,
        items: Vec<BatchItem>,
        mode: BatchMode,
        options: DispatchOptions,
    ) -> BatchTicket {
        let (tx, rx) = oneshot::channel();
        if items.is_empty() {
            settle_now(tx, Ok(Vec::new()));
            return BatchTicket {
                batch: None,
                members: Vec::new(),
                rx,
            };
        }
        let total = items.len();
        let mut core = self.shared.lock();
        let (batch, members) = match core.builder.build_batch(items, mode, &options) {
            Ok(built) => built,
            Err(err) => {
                drop(core);
                warn!(%err, "batch refused");
                settle_now(tx, Err(err));
                return BatchTicket {
                    batch: None,
                    members: Vec::new(),
                    rx,
                };
            }
        };
        core.reorder.open(batch, mode, total, tx);
        let ids = members.iter().map(Instruction::id).collect();
        let mut launches = Vec::new();
        for member in members {
            launches.extend(self.shared.admit(&mut core, member, None));
        }
        drop(core);
        debug!(%batch, "batch admitted");
        self.shared.launch(launches);
        BatchTicket {
            batch: Some(batch),
            members: ids,
            rx,
        }
    }

    /// Dispatches a fresh attempt of a finalized instruction.
    ///
    /// The new instruction keeps the correlation id and source of `record`
    /// and carries `retry_count + 1`. It is always standalone.
    #[instrument(skip(self, record), fields(previous = %record.id, kind = %record.kind))]
    pub fn retry(&self, record: &InstructionRecord) -> Ticket {
        let (tx, rx) = oneshot::channel();
        let mut core = self.shared.lock();
        let instruction = match core.builder.build_retry(record) {
            Ok(instruction) => instruction,
            Err(err) => {
                drop(core);
                settle_now(tx, Err(err));
                return Ticket { id: None, rx };
            }
        };
        let id = instruction.id;
        let launches = self.shared.admit(&mut core, instruction, Some(tx));
        drop(core);
        self.shared.launch(launches);
        Ticket { id: Some(id), rx }
    }

    /// Cancels a still-pending instruction.
    ///
    /// Returns `false` when `id` is not pending (already issued, finalized,
    /// or unknown). A cancelled batch member counts as that member's failure.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: InstructionId) -> bool {
        let mut core = self.shared.lock();
        let Some(mut instruction) = core.scheduler.cancel(id) else {
            return false;
        };
        warn!("instruction cancelled");
        instruction.outcome = Some(Err(PipelineError::Cancelled { id }));
        let now = self.shared.clock.now();
        let ready = core.reorder.accept(instruction);
        self.shared.finish(&mut core, ready, now);
        let launches = self.shared.issue(&mut core, now);
        drop(core);
        self.shared.launch(launches);
        true
    }

    /// Runs one scheduling pass. Normally unnecessary: every release already
    /// triggers one.
    pub fn tick(&self) {
        Shared::schedule(&self.shared);
    }

    /// Spawns the periodic fallback tick configured by `safety_tick_ms`.
    ///
    /// The task holds a weak reference and stops once every pipeline handle
    /// is dropped. Returns `None` when the safety tick is disabled or no
    /// tokio runtime is available.
    pub fn spawn_safety_tick(&self) -> Option<JoinHandle<()>> {
        let period = self.shared.config.safety_tick()?;
        let Ok(runtime) = Handle::try_current() else {
            warn!("safety tick needs a tokio runtime");
            return None;
        };
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?period, "safety tick started");
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                Shared::schedule(&shared);
            }
            debug!("safety tick stopped");
        }))
    }

    /// Counter snapshot.
    pub fn status(&self) -> PipelineStatus {
        let core = self.shared.lock();
        let sched = core.scheduler.snapshot();
        let totals = core.writeback.totals();
        PipelineStatus {
            pending_count: sched.pending,
            active_count: sched.active,
            parked_count: core.reorder.parked_len(),
            open_batches: core.reorder.open_batches(),
            locked_resources: sched.locked,
            committed_total: totals.committed,
            failed_total: totals.failed,
        }
    }

    /// Progress of an unsettled batch.
    pub fn batch_progress(&self, batch: BatchId) -> Option<BatchProgress> {
        self.shared.lock().reorder.progress(batch)
    }

    /// Snapshot of an instruction that is in flight or still retained.
    pub fn instruction(&self, id: InstructionId) -> Option<InstructionRecord> {
        let now = self.shared.clock.now();
        let core = self.shared.lock();
        core.scheduler
            .pending(id)
            .or_else(|| core.scheduler.active(id))
            .or_else(|| core.reorder.parked(id))
            .map(Instruction::record)
            .or_else(|| core.retired.get(id, now).cloned())
    }

    /// Status of an instruction that is in flight or still retained.
    pub fn instruction_status(&self, id: InstructionId) -> Option<InstructionStatus> {
        self.instruction(id).map(|r| r.status)
    }

    /// Finalized instructions inside the retention window, oldest first.
    pub fn recent(&self) -> Vec<InstructionRecord> {
        let now = self.shared.clock.now();
        let mut core = self.shared.lock();
        core.retired.prune(now);
        core.retired.visible(now)
    }

    /// Pending instructions that cannot issue right now, and why.
    pub fn blocked(&self) -> Vec<Blocked> {
        self.shared.lock().scheduler.blocked()
    }

    /// Subscribes to lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Active configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, instruction: &Instruction, at: Timestamp) {
        self.events.publish(PipelineEvent::of(instruction, at));
    }

    /// Enqueues a freshly built instruction and runs an issue pass.
    fn admit(
        &self,
        core: &mut Core,
        mut instruction: Instruction,
        settle: Option<oneshot::Sender<Outcome>>,
    ) -> Vec<Launch> {
        instruction.settle = settle;
        let now = instruction.timestamps.pending.unwrap_or_else(|| self.clock.now());
        self.publish(&instruction, now);
        core.scheduler.enqueue(instruction);
        self.issue(core, self.clock.now())
    }

    /// Issue pass; returns the launches to spawn once the lock is dropped.
    fn issue(&self, core: &mut Core, now: Timestamp) -> Vec<Launch> {
        core.scheduler
            .tick(now)
            .into_iter()
            .filter_map(|id| core.scheduler.active(id))
            .map(|instruction| {
                self.publish(instruction, now);
                Launch::of(instruction)
            })
            .collect()
    }

    fn launch(self: &Arc<Self>, launches: Vec<Launch>) {
        if launches.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            self.fail_unlaunched(launches);
            return;
        };
        for launch in launches {
            executor::spawn(&runtime, Arc::clone(self), launch);
        }
    }

    /// Closes the windows of launches that have no runtime to run on,
    /// including whatever their release issues in turn.
    fn fail_unlaunched(&self, mut launches: Vec<Launch>) {
        while let Some(launch) = launches.pop() {
            warn!(id = %launch.id, "no tokio runtime; instruction failed");
            let now = self.clock.now();
            let mut core = self.lock();
            let failed = ExecutionResult::Completed(Err(HandlerError::NoRuntime));
            self.complete(&mut core, launch.id, failed, now);
            launches.extend(self.issue(&mut core, now));
        }
    }

    fn schedule(self: &Arc<Self>) {
        let now = self.clock.now();
        let launches = {
            let mut core = self.lock();
            self.issue(&mut core, now)
        };
        if !launches.is_empty() {
            debug!(issued = launches.len(), "scheduling pass");
        }
        self.launch(launches);
    }

    /// Writes back everything in `ready`, following atomic aborts until no
    /// more work is released.
    fn finish(&self, core: &mut Core, ready: ReadySet, now: Timestamp) {
        let mut queue = VecDeque::from([ready]);
        while let Some(set) = queue.pop_front() {
            for mut instruction in set.instructions {
                match core.writeback.apply(&mut instruction, now) {
                    Ok(_) => {
                        self.publish(&instruction, now);
                        core.retired.push(instruction.record(), now);
                    }
                    Err(err) => warn!(%err, "write-back skipped"),
                }
            }
            if let Some((batch, cause)) = set.aborted {
                for mut member in core.scheduler.take_pending_batch(batch) {
                    member.outcome = Some(Err(PipelineError::BatchAborted {
                        id: member.id,
                        batch,
                        cause,
                    }));
                    queue.push_back(core.reorder.accept(member));
                }
            }
            if let Some(settlement) = set.settlement {
                WriteBack::settle_batch(settlement);
            }
        }
    }

    /// Closes an execution window: `Responded`, then write-back or parking,
    /// then release and a fresh issue pass.
    fn complete(&self, core: &mut Core, id: InstructionId, result: ExecutionResult, now: Timestamp) {
        let Some(instruction) = core.scheduler.active_mut(id) else {
            warn!(%id, "result for instruction that is not active");
            return;
        };
        instruction.outcome = Some(match result {
            ExecutionResult::Rejected => Err(PipelineError::ValidationFailed {
                id,
                kind: instruction.kind.clone(),
            }),
            ExecutionResult::Completed(Ok(value)) => Ok(value),
            ExecutionResult::Completed(Err(source)) => Err(PipelineError::Handler {
                id,
                kind: instruction.kind.clone(),
                source,
            }),
        });
        if let Err(err) = instruction.transition(InstructionStatus::Responded, now) {
            warn!(%err, "respond skipped");
        }
        self.publish(instruction, now);

        if instruction.batch.is_none() {
            // standalone: terminal status first, then release
            match core.writeback.apply(instruction, now) {
                Ok(_) => self.publish(instruction, now),
                Err(err) => warn!(%err, "write-back skipped"),
            }
            if let Some(released) = core.scheduler.release(id) {
                core.retired.push(released.record(), now);
            }
        } else if let Some(member) = core.scheduler.release(id) {
            // batch member: parking frees its slot and locks
            let ready = core.reorder.accept(member);
            self.finish(core, ready, now);
        }
    }
}

impl ExecutionSink for Shared {
    fn on_executing(&self, id: InstructionId) {
        let now = self.clock.now();
        let mut core = self.lock();
        if let Some(instruction) = core.scheduler.active_mut(id) {
            match instruction.transition(InstructionStatus::Executing, now) {
                Ok(()) => self.publish(instruction, now),
                Err(err) => warn!(%err, "execute skipped"),
            }
        }
    }

    fn on_result(self: Arc<Self>, id: InstructionId, result: ExecutionResult) {
        let now = self.clock.now();
        let launches = {
            let mut core = self.lock();
            self.complete(&mut core, id, result, now);
            self.issue(&mut core, now)
        };
        self.launch(launches);
    }
}

/// Settles a handle whose receiver is still held by the caller.
fn settle_now<T>(tx: oneshot::Sender<T>, value: T) {
    if tx.send(value).is_err() {
        debug!("handle dropped before settle");
    }
}
