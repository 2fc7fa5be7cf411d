// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Instruction model: context, status state machine, batch membership.
//!
//! Every instruction walks
//! `Pending -> Issued -> Executing -> Responded -> {Committed | Failed}`.
//! Two shortcuts exist and nothing else:
//! - `Pending -> Failed` when a never-issued instruction is cancelled (by the
//!   caller, or because its atomic batch rolled back);
//! - `Issued -> Responded` when the operation's pre-check rejects it before
//!   any side effect.
//!
//! Retries are new instructions with an incremented `retry_count`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::catalogue::Operation;
use crate::clock::Timestamp;
use crate::error::{PipelineError, TransitionError};
use crate::ident::{BatchId, CorrelationId, InstructionId, ResourceId};

/// Final value (or error) of one instruction.
pub type Outcome = Result<Value, PipelineError>;

/// Who submitted an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Interactive user action.
    #[default]
    User,
    /// Background/system work.
    System,
    /// Test harness.
    Test,
}

/// Context handed to the operation handler alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionContext {
    /// Correlation id (shared across retries).
    pub correlation_id: CorrelationId,
    /// Creation time.
    pub created_at: Timestamp,
    /// Submitter.
    pub source: Source,
    /// Number of earlier attempts of the same work.
    pub retry_count: u32,
}

/// Lifecycle status of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructionStatus {
    /// Queued, waiting for resources or a concurrency slot.
    Pending,
    /// Resources locked; execution scheduled.
    Issued,
    /// Handler running.
    Executing,
    /// Handler settled (or pre-check rejected); awaiting write-back.
    Responded,
    /// Terminal: succeeded.
    Committed,
    /// Terminal: failed, cancelled, or rolled back.
    Failed,
}

impl InstructionStatus {
    /// True for `Committed` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    /// Whether the state machine admits `self -> to`.
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Issued | Self::Failed)
                | (Self::Issued, Self::Executing | Self::Responded)
                | (Self::Executing, Self::Responded)
                | (Self::Responded, Self::Committed | Self::Failed)
        )
    }

    /// Upper-case label used in logs and reports.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Issued => "ISSUED",
            Self::Executing => "EXECUTING",
            Self::Responded => "RESPONDED",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for InstructionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Entry time of each stage an instruction passed through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimestamps {
    /// Entered `Pending`.
    pub pending: Option<Timestamp>,
    /// Entered `Issued`.
    pub issued: Option<Timestamp>,
    /// Entered `Executing`.
    pub executing: Option<Timestamp>,
    /// Entered `Responded`.
    pub responded: Option<Timestamp>,
    /// Entered `Committed`.
    pub committed: Option<Timestamp>,
    /// Entered `Failed`.
    pub failed: Option<Timestamp>,
}

impl StageTimestamps {
    /// Records entry into `status` at `at`.
    pub fn stamp(&mut self, status: InstructionStatus, at: Timestamp) {
        let slot = match status {
            InstructionStatus::Pending => &mut self.pending,
            InstructionStatus::Issued => &mut self.issued,
            InstructionStatus::Executing => &mut self.executing,
            InstructionStatus::Responded => &mut self.responded,
            InstructionStatus::Committed => &mut self.committed,
            InstructionStatus::Failed => &mut self.failed,
        };
        *slot = Some(at);
    }

    /// Entry time of `status`, if reached.
    pub fn get(&self, status: InstructionStatus) -> Option<Timestamp> {
        match status {
            InstructionStatus::Pending => self.pending,
            InstructionStatus::Issued => self.issued,
            InstructionStatus::Executing => self.executing,
            InstructionStatus::Responded => self.responded,
            InstructionStatus::Committed => self.committed,
            InstructionStatus::Failed => self.failed,
        }
    }
}

/// Commit discipline of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchMode {
    /// Members succeed or fail independently; write-back follows submission order.
    Ordered,
    /// Any failure rolls the whole batch back.
    Atomic,
}

/// Batch membership shared by all instructions submitted together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchContext {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Commit discipline.
    pub mode: BatchMode,
    /// Member count, fixed at submission.
    pub total_instructions: usize,
    /// 0-based position of this member.
    pub sequence_number: usize,
    /// Submission time.
    pub start_time: Timestamp,
}

/// One unit of asynchronous work tracked by the pipeline.
pub struct Instruction {
    pub(crate) id: InstructionId,
    pub(crate) kind: String,
    pub(crate) payload: Value,
    pub(crate) context: InstructionContext,
    pub(crate) status: InstructionStatus,
    pub(crate) timestamps: StageTimestamps,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) batch: Option<BatchContext>,
    pub(crate) resources: Vec<ResourceId>,
    pub(crate) priority: i32,
    pub(crate) timeout: Option<Duration>,
    pub(crate) operation: Arc<dyn Operation>,
    pub(crate) settle: Option<oneshot::Sender<Outcome>>,
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("resources", &self.resources)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl Instruction {
    /// Identifier.
    pub fn id(&self) -> InstructionId {
        self.id
    }

    /// Operation type name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Opaque handler payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Handler context.
    pub fn context(&self) -> &InstructionContext {
        &self.context
    }

    /// Current status.
    pub fn status(&self) -> InstructionStatus {
        self.status
    }

    /// Stage entry times.
    pub fn timestamps(&self) -> &StageTimestamps {
        &self.timestamps
    }

    /// Batch membership, absent for standalone instructions.
    pub fn batch(&self) -> Option<&BatchContext> {
        self.batch.as_ref()
    }

    /// Resource ids, fixed at creation (sorted, deduplicated).
    pub fn resources(&self) -> &[ResourceId] {
        &self.resources
    }

    /// Handler result, when the instruction succeeded.
    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().and_then(|o| o.as_ref().ok())
    }

    /// Error, when the instruction failed.
    pub fn error(&self) -> Option<&PipelineError> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }

    /// True when an outcome has been recorded and it is an error.
    pub fn has_failed(&self) -> bool {
        self.error().is_some()
    }

    /// Moves the state machine to `to`, stamping the entry time.
    pub(crate) fn transition(
        &mut self,
        to: InstructionStatus,
        at: Timestamp,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.timestamps.stamp(to, at);
        Ok(())
    }

    /// Immutable diagnostic snapshot.
    pub fn record(&self) -> InstructionRecord {
        InstructionRecord {
            id: self.id,
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            context: self.context.clone(),
            status: self.status,
            timestamps: self.timestamps,
            result: self.result().cloned(),
            error: self.error().cloned(),
            batch: self.batch,
            resources: self.resources.clone(),
        }
    }
}

/// Snapshot of an instruction, used for diagnostics and retries.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionRecord {
    /// Identifier.
    pub id: InstructionId,
    /// Operation type name.
    pub kind: String,
    /// Handler payload.
    pub payload: Value,
    /// Handler context.
    pub context: InstructionContext,
    /// Status at snapshot time.
    pub status: InstructionStatus,
    /// Stage entry times.
    pub timestamps: StageTimestamps,
    /// Handler result (mutually exclusive with `error`).
    pub result: Option<Value>,
    /// Failure (mutually exclusive with `result`).
    pub error: Option<PipelineError>,
    /// Batch membership.
    pub batch: Option<BatchContext>,
    /// Resource ids.
    pub resources: Vec<ResourceId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstructionStatus::{Committed, Executing, Failed, Issued, Pending, Responded};

    #[test]
    fn happy_path_is_admitted() {
        let path = [Pending, Issued, Executing, Responded, Committed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for to in [Pending, Issued, Executing, Responded, Committed, Failed] {
            assert!(!Committed.can_transition_to(to));
            assert!(!Failed.can_transition_to(to));
        }
    }

    #[test]
    fn no_state_is_revisited_or_skipped() {
        assert!(!Executing.can_transition_to(Issued));
        assert!(!Responded.can_transition_to(Executing));
        assert!(!Pending.can_transition_to(Executing));
        assert!(!Pending.can_transition_to(Committed));
        assert!(!Executing.can_transition_to(Committed));
        assert!(!Issued.can_transition_to(Failed));
    }

    #[test]
    fn shortcuts_are_cancel_and_precheck() {
        assert!(Pending.can_transition_to(Failed));
        assert!(Issued.can_transition_to(Responded));
    }

    #[test]
    fn stamps_are_recorded_per_stage() {
        let mut ts = StageTimestamps::default();
        ts.stamp(Issued, 10);
        ts.stamp(Responded, 30);
        assert_eq!(ts.get(Issued), Some(10));
        assert_eq!(ts.get(Responded), Some(30));
        assert_eq!(ts.get(Executing), None);
    }
}
