// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Event probe: records a pipeline's lifecycle events for assertions.
//!
//! The probe subscribes when created and pulls buffered events on
//! [`Probe::drain`], so nothing runs in the background.

use std::collections::BTreeMap;

use echo_pipeline::{InstructionId, InstructionStatus, Pipeline, PipelineEvent, Timestamp};
use tokio::sync::broadcast::{self, error::TryRecvError};

/// `[issued, responded)` window of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Entry into `Issued`.
    pub issued: Timestamp,
    /// Entry into `Responded`.
    pub responded: Timestamp,
}

impl Window {
    /// Whether two half-open windows share any instant.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.issued < other.responded && other.issued < self.responded
    }
}

/// Recorder of [`PipelineEvent`]s.
#[derive(Debug)]
pub struct Probe {
    rx: broadcast::Receiver<PipelineEvent>,
    events: Vec<PipelineEvent>,
    lagged: u64,
}

impl Probe {
    /// Subscribes to `pipeline`.
    pub fn attach(pipeline: &Pipeline) -> Self {
        Self {
            rx: pipeline.subscribe(),
            events: Vec::new(),
            lagged: 0,
        }
    }

    /// Pulls every buffered event into the log.
    pub fn drain(&mut self) -> &[PipelineEvent] {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.events.push(event),
                Err(TryRecvError::Lagged(n)) => self.lagged += n,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        &self.events
    }

    /// Events recorded so far.
    pub fn events(&self) -> &[PipelineEvent] {
        &self.events
    }

    /// Events lost because the probe fell behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Statuses `id` passed through, in order.
    pub fn trace(&self, id: InstructionId) -> Vec<InstructionStatus> {
        self.events
            .iter()
            .filter(|e| e.instruction == id)
            .map(|e| e.status)
            .collect()
    }

    /// Time `id` entered `status`.
    pub fn entered(&self, id: InstructionId, status: InstructionStatus) -> Option<Timestamp> {
        self.events
            .iter()
            .find(|e| e.instruction == id && e.status == status)
            .map(|e| e.at)
    }

    /// `[issued, responded)` window of `id`, once it has responded.
    pub fn window(&self, id: InstructionId) -> Option<Window> {
        Some(Window {
            issued: self.entered(id, InstructionStatus::Issued)?,
            responded: self.entered(id, InstructionStatus::Responded)?,
        })
    }

    /// Instructions in the order they were written back.
    pub fn write_back_order(&self) -> Vec<InstructionId> {
        self.events
            .iter()
            .filter(|e| e.status.is_terminal())
            .map(|e| e.instruction)
            .collect()
    }

    /// Terminal status of every finalized instruction.
    pub fn terminal_statuses(&self) -> BTreeMap<InstructionId, InstructionStatus> {
        self.events
            .iter()
            .filter(|e| e.status.is_terminal())
            .map(|e| (e.instruction, e.status))
            .collect()
    }

    /// Largest number of simultaneously active instructions seen.
    pub fn peak_active(&self) -> usize {
        let mut active = 0usize;
        let mut peak = 0usize;
        for event in &self.events {
            match event.status {
                InstructionStatus::Issued => {
                    active += 1;
                    peak = peak.max(active);
                }
                InstructionStatus::Responded => active = active.saturating_sub(1),
                _ => {}
            }
        }
        peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_windows_do_not_overlap() {
        let a = Window {
            issued: 0,
            responded: 100,
        };
        let b = Window {
            issued: 100,
            responded: 110,
        };
        let c = Window {
            issued: 50,
            responded: 60,
        };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&a));
    }
}
