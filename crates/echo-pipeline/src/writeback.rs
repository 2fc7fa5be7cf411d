// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Write-back: terminal status assignment and handle settlement.

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::clock::Timestamp;
use crate::error::{PipelineError, TransitionError};
use crate::instruction::{Instruction, InstructionStatus};
use crate::reorder::BatchSettlement;

/// Totals of terminal statuses assigned so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteBackTotals {
    /// Instructions written back as `Committed`.
    pub committed: u64,
    /// Instructions written back as `Failed`.
    pub failed: u64,
}

/// Applies terminal statuses and settles caller handles.
#[derive(Debug, Default)]
pub(crate) struct WriteBack {
    totals: WriteBackTotals,
}

impl WriteBack {
    /// Finalizes one instruction.
    ///
    /// `Committed` iff its outcome is a success; otherwise `Failed`. The
    /// instruction's own handle, if any, is settled with the same outcome.
    pub(crate) fn apply(
        &mut self,
        instruction: &mut Instruction,
        now: Timestamp,
    ) -> Result<InstructionStatus, TransitionError> {
        let outcome = instruction
            .outcome
            .get_or_insert_with(|| Err(PipelineError::Closed))
            .clone();
        let terminal = if outcome.is_ok() {
            InstructionStatus::Committed
        } else {
            InstructionStatus::Failed
        };
        instruction.transition(terminal, now)?;
        match terminal {
            InstructionStatus::Committed => self.totals.committed += 1,
            _ => self.totals.failed += 1,
        }
        if let Some(err) = instruction.error() {
            warn!(id = %instruction.id, kind = %instruction.kind, %err, "instruction failed");
        } else {
            debug!(id = %instruction.id, kind = %instruction.kind, "instruction committed");
        }
        if let Some(tx) = instruction.settle.take() {
            if tx.send(outcome).is_err() {
                trace!(id = %instruction.id, "handle dropped before settle");
            }
        }
        Ok(terminal)
    }

    /// Settles a batch handle.
    pub(crate) fn settle_batch(settlement: BatchSettlement) {
        let BatchSettlement {
            batch,
            sender,
            outcome,
        } = settlement;
        debug!(%batch, ok = outcome.is_ok(), "batch handle settled");
        if let Some(tx) = sender {
            if tx.send(outcome).is_err() {
                trace!(%batch, "batch handle dropped before settle");
            }
        }
    }

    /// Terminal totals.
    pub(crate) fn totals(&self) -> WriteBackTotals {
        self.totals
    }
}
