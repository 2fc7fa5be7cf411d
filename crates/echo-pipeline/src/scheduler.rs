// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Conflict-aware issue scheduler.
//!
//! Owns the pending queue, the active set, and the resource tracker.
//!
//! Issue invariant:
//! - An instruction issues only if `|active| < concurrency_cap` and none of its
//!   resource ids is locked.
//! - Issuability is re-evaluated against the *current* lock state after every
//!   single issuance. Computing a candidate set against one lock snapshot and
//!   issuing it wholesale would let two conflicting instructions issue in the
//!   same pass.
//!
//! Pending order is descending priority, FIFO within equal priority. The scan
//! always restarts from the head, so an instruction blocked on a resource
//! never starves one behind it that is free to run.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::Timestamp;
use crate::error::TransitionError;
use crate::ident::{BatchId, InstructionId, ResourceId};
use crate::instruction::{Instruction, InstructionStatus};
use crate::tracker::ResourceTracker;

/// Why a pending instruction cannot issue right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockReason {
    /// Every concurrency slot is taken.
    CapReached,
    /// A resource is held by another instruction.
    Conflict {
        /// Contended resource.
        resource: ResourceId,
        /// Current holder.
        holder: InstructionId,
    },
}

/// Pending instruction that the last scan could not issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocked {
    /// Waiting instruction.
    pub id: InstructionId,
    /// Why it waits.
    pub reason: BlockReason,
}

/// Counters exposed by [`Scheduler::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// Instructions waiting to issue.
    pub pending: usize,
    /// Instructions issued and not yet released.
    pub active: usize,
    /// Locked resource ids.
    pub locked: usize,
    /// Instructions issued since creation.
    pub issued_total: u64,
}

/// Pending queue + active set + resource locks.
#[derive(Debug)]
pub struct Scheduler {
    pending: VecDeque<Instruction>,
    active: HashMap<InstructionId, Instruction>,
    tracker: ResourceTracker,
    concurrency_cap: usize,
    issued_total: u64,
}

impl Scheduler {
    /// Creates a scheduler allowing at most `concurrency_cap` active instructions.
    pub fn new(concurrency_cap: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            active: HashMap::new(),
            tracker: ResourceTracker::new(),
            concurrency_cap,
            issued_total: 0,
        }
    }

    /// Maximum number of simultaneously active instructions.
    pub fn concurrency_cap(&self) -> usize {
        self.concurrency_cap
    }

    /// Queues a `Pending` instruction behind every pending instruction of
    /// equal or higher priority.
    pub fn enqueue(&mut self, instruction: Instruction) {
        debug_assert_eq!(instruction.status, InstructionStatus::Pending);
        let pos = self
            .pending
            .iter()
            .position(|queued| queued.priority < instruction.priority)
            .unwrap_or(self.pending.len());
        trace!(id = %instruction.id, kind = %instruction.kind, pos, "enqueued");
        self.pending.insert(pos, instruction);
    }

    /// Whether `instruction` could issue against the current state.
    pub fn can_issue(&self, instruction: &Instruction) -> bool {
        self.active.len() < self.concurrency_cap && self.tracker.is_free(&instruction.resources)
    }

    /// Issues pending instructions until a full scan finds nothing issuable.
    ///
    /// Returns the ids issued during this pass, in issue order. The caller
    /// launches their execution outside the scheduling critical section.
    pub fn tick(&mut self, now: Timestamp) -> Vec<InstructionId> {
        let mut issued = Vec::new();
        while let Some(pos) = self.next_issuable() {
            let Some(instruction) = self.pending.remove(pos) else {
                break;
            };
            match self.issue(instruction, now) {
                Ok(id) => issued.push(id),
                Err(err) => debug!(%err, "skipped issue"),
            }
        }
        issued
    }

    /// Index of the first pending instruction issuable right now.
    fn next_issuable(&self) -> Option<usize> {
        if self.active.len() >= self.concurrency_cap {
            return None;
        }
        self.pending
            .iter()
            .position(|candidate| self.tracker.is_free(&candidate.resources))
    }

    /// Moves `instruction` into the active set and locks its resources.
    fn issue(&mut self, mut instruction: Instruction, now: Timestamp) -> Result<InstructionId, TransitionError> {
        instruction.transition(InstructionStatus::Issued, now)?;
        let id = instruction.id;
        self.tracker.acquire(id, &instruction.resources);
        debug!(
            id = %id,
            kind = %instruction.kind,
            resources = instruction.resources.len(),
            active = self.active.len() + 1,
            "issued"
        );
        self.active.insert(id, instruction);
        self.issued_total += 1;
        Ok(id)
    }

    /// Removes `id` from the active set and unlocks its resources.
    ///
    /// Called exactly once per issued instruction, when its execution window
    /// closes. The caller re-runs [`Scheduler::tick`] afterwards.
    pub fn release(&mut self, id: InstructionId) -> Option<Instruction> {
        let instruction = self.active.remove(&id)?;
        let freed = self.tracker.release(id, &instruction.resources);
        debug!(id = %id, freed, active = self.active.len(), "released");
        Some(instruction)
    }

    /// Active instruction by id.
    pub fn active(&self, id: InstructionId) -> Option<&Instruction> {
        self.active.get(&id)
    }

    /// Mutable active instruction by id.
    pub(crate) fn active_mut(&mut self, id: InstructionId) -> Option<&mut Instruction> {
        self.active.get_mut(&id)
    }

    /// Pending instruction by id.
    pub fn pending(&self, id: InstructionId) -> Option<&Instruction> {
        self.pending.iter().find(|i| i.id == id)
    }

    /// Removes a still-pending instruction. Issued instructions are not
    /// cancellable.
    pub fn cancel(&mut self, id: InstructionId) -> Option<Instruction> {
        let pos = self.pending.iter().position(|i| i.id == id)?;
        self.pending.remove(pos)
    }

    /// Removes every pending member of `batch`, in queue order.
    pub fn take_pending_batch(&mut self, batch: BatchId) -> Vec<Instruction> {
        let (withdrawn, kept): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|i| i.batch.is_some_and(|b| b.batch_id == batch));
        self.pending = kept.into();
        withdrawn
    }

    /// Pending instructions that cannot issue, with the reason.
    pub fn blocked(&self) -> Vec<Blocked> {
        let cap_reached = self.active.len() >= self.concurrency_cap;
        self.pending
            .iter()
            .filter_map(|i| {
                if let Some((resource, holder)) = self.tracker.first_conflict(&i.resources) {
                    Some(Blocked {
                        id: i.id,
                        reason: BlockReason::Conflict {
                            resource: resource.clone(),
                            holder,
                        },
                    })
                } else if cap_reached {
                    Some(Blocked {
                        id: i.id,
                        reason: BlockReason::CapReached,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Current resource tracker.
    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Number of pending instructions.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of active instructions.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Ids of active instructions (unordered).
    pub fn active_ids(&self) -> impl Iterator<Item = InstructionId> + '_ {
        self.active.keys().copied()
    }

    /// Counter snapshot.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            pending: self.pending.len(),
            active: self.active.len(),
            locked: self.tracker.len(),
            issued_total: self.issued_total,
        }
    }
}
