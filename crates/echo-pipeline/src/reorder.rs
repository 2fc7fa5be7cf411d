// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Completion stage and reorder buffer.
//!
//! Batch members that have responded are parked here until their batch's
//! commit rule says they may be written back:
//! - `ORDERED`: nothing leaves until every member has responded; then all
//!   members leave in ascending `sequence_number`, each with its own outcome.
//! - `ATOMIC`: successes park until the whole batch has succeeded. The first
//!   failure aborts the batch: every parked member leaves immediately, forced
//!   to fail, and members that respond later are forced to fail as they arrive.
//!
//! Members cancelled or withdrawn while still `Pending` enter through the same
//! door with an error outcome and count as failures.
//!
//! Standalone instructions never enter the buffer.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::ident::{BatchId, InstructionId};
use crate::instruction::{BatchMode, Instruction, InstructionStatus, Outcome};

/// Final value of a batch handle.
///
/// `ORDERED`: `Ok` with one outcome per member, in sequence order.
/// `ATOMIC`: `Ok` with every member's value, or `Err` with the first failure.
pub type BatchOutcome = Result<Vec<Outcome>, PipelineError>;

/// Derived counters of one in-flight batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Commit discipline.
    pub mode: BatchMode,
    /// Member count.
    pub total: usize,
    /// Members that have responded (or were cancelled/withdrawn).
    pub completed_count: usize,
    /// Completed members whose own outcome is a success.
    pub success_count: usize,
    /// Completed members whose own outcome is a failure.
    pub failed_count: usize,
    /// Whether the commit rule allows write-back to start.
    pub can_finalize: bool,
    /// Whether an atomic batch was rolled back by a failure.
    pub aborted: bool,
}

/// Batch handle to settle once the last member has been written back.
#[derive(Debug)]
pub(crate) struct BatchSettlement {
    pub(crate) batch: BatchId,
    pub(crate) sender: Option<oneshot::Sender<BatchOutcome>>,
    pub(crate) outcome: BatchOutcome,
}

/// Instructions released for write-back, in write-back order.
#[derive(Debug, Default)]
pub(crate) struct ReadySet {
    /// Members (or a standalone instruction) to write back, in order.
    pub(crate) instructions: Vec<Instruction>,
    /// Set when this result aborted an atomic batch; its pending members
    /// must be withdrawn from the scheduler.
    pub(crate) aborted: Option<(BatchId, InstructionId)>,
    /// Batch handle to settle after `instructions` are written back.
    pub(crate) settlement: Option<BatchSettlement>,
}

impl ReadySet {
    /// Ready set for a standalone instruction.
    pub(crate) fn single(instruction: Instruction) -> Self {
        Self {
            instructions: vec![instruction],
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.instructions.is_empty() && self.settlement.is_none()
    }
}

#[derive(Debug)]
struct BatchEntry {
    mode: BatchMode,
    total: usize,
    completed: usize,
    succeeded: usize,
    failed: usize,
    parked: BTreeMap<usize, Instruction>,
    first_failure: Option<(InstructionId, PipelineError)>,
    handed_out: usize,
    finals: BTreeMap<usize, Outcome>,
    sender: Option<oneshot::Sender<BatchOutcome>>,
}

impl BatchEntry {
    fn can_finalize(&self) -> bool {
        match self.mode {
            BatchMode::Ordered => self.completed == self.total,
            BatchMode::Atomic => self.first_failure.is_some() || self.completed == self.total,
        }
    }

    fn progress(&self, batch_id: BatchId) -> BatchProgress {
        BatchProgress {
            batch_id,
            mode: self.mode,
            total: self.total,
            completed_count: self.completed,
            success_count: self.succeeded,
            failed_count: self.failed,
            can_finalize: self.can_finalize(),
            aborted: self.first_failure.is_some(),
        }
    }

    /// Moves every parked member into `out`, in sequence order.
    fn drain_parked(&mut self, out: &mut Vec<Instruction>) {
        out.extend(std::mem::take(&mut self.parked).into_values());
    }
}

/// Parked batch members keyed by batch.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    batches: HashMap<BatchId, BatchEntry>,
}

impl ReorderBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens bookkeeping for a batch of `total` members.
    pub(crate) fn open(
        &mut self,
        batch: BatchId,
        mode: BatchMode,
        total: usize,
        sender: oneshot::Sender<BatchOutcome>,
    ) {
        self.batches.insert(
            batch,
            BatchEntry {
                mode,
                total,
                completed: 0,
                succeeded: 0,
                failed: 0,
                parked: BTreeMap::new(),
                first_failure: None,
                handed_out: 0,
                finals: BTreeMap::new(),
                sender: Some(sender),
            },
        );
    }

    /// Accepts a batch member whose outcome is known and returns whatever
    /// became ready for write-back.
    ///
    /// `instruction` is either `Responded` (it ran, or its pre-check rejected
    /// it) or still `Pending` (cancelled or withdrawn before issue) with an
    /// error outcome. Standalone instructions are returned as-is.
    pub(crate) fn accept(&mut self, instruction: Instruction) -> ReadySet {
        let Some(ctx) = instruction.batch else {
            return ReadySet::single(instruction);
        };
        debug_assert!(matches!(
            instruction.status,
            InstructionStatus::Responded | InstructionStatus::Pending
        ));
        let Some(entry) = self.batches.get_mut(&ctx.batch_id) else {
            warn!(id = %instruction.id, batch = %ctx.batch_id, "result for unknown batch");
            return ReadySet::single(instruction);
        };

        entry.completed += 1;
        let own_failure = instruction.error().cloned();
        if own_failure.is_some() {
            entry.failed += 1;
        } else {
            entry.succeeded += 1;
        }

        let mut ready = ReadySet::default();
        match entry.mode {
            BatchMode::Ordered => {
                entry.parked.insert(ctx.sequence_number, instruction);
                if entry.completed == entry.total {
                    entry.drain_parked(&mut ready.instructions);
                }
            }
            BatchMode::Atomic => match (entry.first_failure.as_ref().map(|f| f.0), own_failure) {
                (Some(cause), _) => {
                    ready
                        .instructions
                        .push(force_abort(instruction, ctx.batch_id, cause));
                }
                (None, Some(err)) => {
                    let cause = instruction.id;
                    warn!(batch = %ctx.batch_id, %cause, %err, "atomic batch aborted");
                    entry.first_failure = Some((cause, err));
                    ready.aborted = Some((ctx.batch_id, cause));
                    let parked = std::mem::take(&mut entry.parked);
                    ready.instructions.extend(
                        parked
                            .into_values()
                            .map(|member| force_abort(member, ctx.batch_id, cause)),
                    );
                    ready.instructions.push(instruction);
                }
                (None, None) => {
                    entry.parked.insert(ctx.sequence_number, instruction);
                    if entry.completed == entry.total {
                        entry.drain_parked(&mut ready.instructions);
                    }
                }
            },
        }

        entry.handed_out += ready.instructions.len();
        for member in &ready.instructions {
            if let (Some(mctx), Some(outcome)) = (member.batch, member.outcome.as_ref()) {
                entry.finals.insert(mctx.sequence_number, outcome.clone());
            }
        }
        debug!(
            batch = %ctx.batch_id,
            completed = entry.completed,
            total = entry.total,
            released = ready.instructions.len(),
            "batch progress"
        );

        if entry.handed_out == entry.total {
            if let Some(entry) = self.batches.remove(&ctx.batch_id) {
                ready.settlement = Some(settle(ctx.batch_id, entry));
            }
        }
        ready
    }

    /// Progress of an in-flight batch; `None` once the batch has settled.
    pub fn progress(&self, batch: BatchId) -> Option<BatchProgress> {
        self.batches.get(&batch).map(|e| e.progress(batch))
    }

    /// Number of members parked across all batches.
    pub fn parked_len(&self) -> usize {
        self.batches.values().map(|e| e.parked.len()).sum()
    }

    /// Parked member by id.
    pub fn parked(&self, id: InstructionId) -> Option<&Instruction> {
        self.batches
            .values()
            .flat_map(|e| e.parked.values())
            .find(|i| i.id == id)
    }

    /// Number of batches still open.
    pub fn open_batches(&self) -> usize {
        self.batches.len()
    }
}

/// Forces a member of an aborted atomic batch to fail.
///
/// A member that failed on its own keeps its own error.
fn force_abort(mut member: Instruction, batch: BatchId, cause: InstructionId) -> Instruction {
    if !member.has_failed() {
        member.outcome = Some(Err(PipelineError::BatchAborted {
            id: member.id,
            batch,
            cause,
        }));
    }
    member
}

fn settle(batch: BatchId, mut entry: BatchEntry) -> BatchSettlement {
    let outcome = match (entry.mode, entry.first_failure.take()) {
        (BatchMode::Atomic, Some((_, err))) => Err(err),
        _ => Ok(std::mem::take(&mut entry.finals).into_values().collect()),
    };
    info!(
        batch = %batch,
        mode = ?entry.mode,
        total = entry.total,
        failed = entry.failed,
        "batch finalized"
    );
    BatchSettlement {
        batch,
        sender: entry.sender.take(),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::*;
    use crate::catalogue::{Catalogue, FnOperation};
    use crate::clock::ManualClock;
    use crate::context::{BatchItem, ContextBuilder, DispatchOptions};
    use crate::error::HandlerError;

    fn members(n: usize, mode: BatchMode) -> (BatchId, Vec<Instruction>) {
        let op = FnOperation::new(|_| Vec::new(), |_, _| async { Ok(Value::Null) });
        let catalogue = Catalogue::new().with("op", op).unwrap();
        let mut b = ContextBuilder::new(Arc::new(catalogue), Arc::new(ManualClock::new(0)));
        let items = (0..n).map(|i| BatchItem::new("op", json!(i))).collect();
        b.build_batch(items, mode, &DispatchOptions::default()).unwrap()
    }

    fn respond(mut i: Instruction, outcome: Outcome) -> Instruction {
        i.transition(InstructionStatus::Issued, 1).unwrap();
        i.transition(InstructionStatus::Executing, 2).unwrap();
        i.transition(InstructionStatus::Responded, 3).unwrap();
        i.outcome = Some(outcome);
        i
    }

    fn ok(i: Instruction) -> Instruction {
        let v = i.payload().clone();
        respond(i, Ok(v))
    }

    fn fail(i: Instruction) -> Instruction {
        let err = PipelineError::Handler {
            id: i.id(),
            kind: i.kind().to_owned(),
            source: HandlerError::failed("boom"),
        };
        respond(i, Err(err))
    }

    fn seqs(ready: &ReadySet) -> Vec<usize> {
        ready
            .instructions
            .iter()
            .map(|i| i.batch().unwrap().sequence_number)
            .collect()
    }

    #[test]
    fn ordered_waits_for_all_then_sorts() {
        let (batch, mut m) = members(3, BatchMode::Ordered);
        let mut buf = ReorderBuffer::new();
        let (tx, _rx) = oneshot::channel();
        buf.open(batch, BatchMode::Ordered, 3, tx);
        let z = m.pop().unwrap();
        let y = m.pop().unwrap();
        let x = m.pop().unwrap();

        assert!(buf.accept(ok(z)).is_empty());
        assert!(buf.accept(ok(x)).is_empty());
        assert_eq!(buf.parked_len(), 2);
        let progress = buf.progress(batch).unwrap();
        assert_eq!((progress.completed_count, progress.can_finalize), (2, false));

        let ready = buf.accept(fail(y));
        assert_eq!(seqs(&ready), vec![0, 1, 2]);
        assert!(ready.instructions[1].has_failed());
        assert!(!ready.instructions[0].has_failed());
        let settlement = ready.settlement.unwrap();
        let outcomes = settlement.outcome.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[1].is_err());
        assert!(buf.progress(batch).is_none());
    }

    #[test]
    fn atomic_all_success_commits_in_sequence() {
        let (batch, m) = members(3, BatchMode::Atomic);
        let mut buf = ReorderBuffer::new();
        let (tx, _rx) = oneshot::channel();
        buf.open(batch, BatchMode::Atomic, 3, tx);
        let mut last = ReadySet::default();
        for i in m.into_iter().rev() {
            last = buf.accept(ok(i));
        }
        assert_eq!(seqs(&last), vec![0, 1, 2]);
        let expected: Vec<Outcome> = vec![Ok(json!(0)), Ok(json!(1)), Ok(json!(2))];
        assert_eq!(last.settlement.unwrap().outcome.unwrap(), expected);
    }

    #[test]
    fn atomic_first_failure_aborts_parked_and_later_members() {
        let (batch, mut m) = members(3, BatchMode::Atomic);
        let mut buf = ReorderBuffer::new();
        let (tx, _rx) = oneshot::channel();
        buf.open(batch, BatchMode::Atomic, 3, tx);
        let z = m.pop().unwrap();
        let y = m.pop().unwrap();
        let x = m.pop().unwrap();
        let y_id = y.id();

        assert!(buf.accept(ok(x)).is_empty());
        let ready = buf.accept(fail(y));
        assert_eq!(ready.aborted, Some((batch, y_id)));
        assert_eq!(seqs(&ready), vec![0, 1]);
        assert!(ready.instructions.iter().all(Instruction::has_failed));
        assert!(ready.instructions[0].error().unwrap().is_batch_aborted());
        assert!(ready.settlement.is_none());
        assert!(buf.progress(batch).unwrap().aborted);

        // Z would have succeeded, but the batch is already rolled back.
        let ready = buf.accept(ok(z));
        assert_eq!(seqs(&ready), vec![2]);
        assert_eq!(
            ready.instructions[0].error(),
            Some(&PipelineError::BatchAborted {
                id: ready.instructions[0].id(),
                batch,
                cause: y_id
            })
        );
        let err = ready.settlement.unwrap().outcome.unwrap_err();
        assert_eq!(err.instruction(), Some(y_id));
    }

    #[test]
    fn withdrawn_pending_member_counts_as_failure() {
        let (batch, mut m) = members(2, BatchMode::Ordered);
        let mut buf = ReorderBuffer::new();
        let (tx, _rx) = oneshot::channel();
        buf.open(batch, BatchMode::Ordered, 2, tx);
        let mut cancelled = m.pop().unwrap();
        cancelled.outcome = Some(Err(PipelineError::Cancelled { id: cancelled.id() }));
        assert!(buf.accept(cancelled).is_empty());
        assert_eq!(buf.progress(batch).unwrap().failed_count, 1);
        let ready = buf.accept(ok(m.pop().unwrap()));
        assert_eq!(ready.instructions[1].status(), InstructionStatus::Pending);
    }

    #[test]
    fn standalone_passes_through() {
        let op = FnOperation::new(|_| Vec::new(), |_, _| async { Ok(Value::Null) });
        let catalogue = Catalogue::new().with("op", op).unwrap();
        let mut b = ContextBuilder::new(Arc::new(catalogue), Arc::new(ManualClock::new(0)));
        let i = b
            .build_single("op", Value::Null, &DispatchOptions::default())
            .unwrap();
        let mut buf = ReorderBuffer::new();
        let ready = buf.accept(ok(i));
        assert_eq!(ready.instructions.len(), 1);
        assert!(ready.settlement.is_none());
    }
}
