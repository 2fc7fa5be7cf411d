// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Lifecycle event stream.
//!
//! Every status transition is published as a [`PipelineEvent`] in the order
//! it happened. Write-back events therefore arrive in write-back order.
//! Slow subscribers lag (and are told so by `broadcast`); publishing never
//! blocks the pipeline.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::clock::Timestamp;
use crate::ident::{BatchId, InstructionId};
use crate::instruction::{Instruction, InstructionStatus};

/// One stage transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineEvent {
    /// Instruction that moved.
    pub instruction: InstructionId,
    /// Operation type name.
    pub kind: String,
    /// Batch id and sequence number, for batch members.
    pub batch: Option<(BatchId, usize)>,
    /// Status entered.
    pub status: InstructionStatus,
    /// Entry time.
    pub at: Timestamp,
}

impl PipelineEvent {
    /// Event describing `instruction`'s current status.
    pub fn of(instruction: &Instruction, at: Timestamp) -> Self {
        Self {
            instruction: instruction.id(),
            kind: instruction.kind().to_owned(),
            batch: instruction
                .batch()
                .map(|b| (b.batch_id, b.sequence_number)),
            status: instruction.status(),
            at,
        }
    }
}

/// Broadcast sender wrapper.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes `event`; a bus without subscribers drops it.
    pub fn publish(&self, event: PipelineEvent) {
        trace!(id = %event.instruction, status = %event.status, "event");
        // send only fails when nobody is listening
        let _ = self.tx.send(event);
    }

    /// New subscriber receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u64, status: InstructionStatus) -> PipelineEvent {
        PipelineEvent {
            instruction: InstructionId::from_raw(n),
            kind: "op".into(),
            batch: None,
            status,
            at: n,
        }
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(event(1, InstructionStatus::Issued));
        bus.publish(event(1, InstructionStatus::Executing));
        assert_eq!(rx.recv().await.unwrap().status, InstructionStatus::Issued);
        assert_eq!(rx.recv().await.unwrap().status, InstructionStatus::Executing);
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(1);
        bus.publish(event(1, InstructionStatus::Pending));
        let mut late = bus.subscribe();
        assert!(late.try_recv().is_err());
    }
}
