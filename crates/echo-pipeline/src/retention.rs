// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded TTL log of finalized instruction records.

use std::collections::VecDeque;

use crate::clock::Timestamp;
use crate::ident::InstructionId;
use crate::instruction::InstructionRecord;

#[derive(Debug, Clone)]
struct Retained {
    expires_at: Timestamp,
    record: InstructionRecord,
}

/// Finalized records kept for diagnostics, oldest first.
#[derive(Debug)]
pub struct RetiredLog {
    queue: VecDeque<Retained>,
    max: usize,
    ttl_ms: u64,
}

impl RetiredLog {
    /// Create a log holding at most `max` records for `ttl_ms` each.
    pub fn new(max: usize, ttl_ms: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            max,
            ttl_ms,
        }
    }

    /// Retain `record`, evicting the oldest entry when full.
    pub fn push(&mut self, record: InstructionRecord, now: Timestamp) {
        if self.max == 0 || self.ttl_ms == 0 {
            return;
        }
        if self.queue.len() == self.max {
            self.queue.pop_front();
        }
        self.queue.push_back(Retained {
            expires_at: now.saturating_add(self.ttl_ms),
            record,
        });
    }

    /// Drop expired records.
    pub fn prune(&mut self, now: Timestamp) {
        self.queue.retain(|r| now < r.expires_at);
    }

    /// Unexpired records, oldest first.
    pub fn visible(&self, now: Timestamp) -> Vec<InstructionRecord> {
        self.queue
            .iter()
            .filter(|r| now < r.expires_at)
            .map(|r| r.record.clone())
            .collect()
    }

    /// Unexpired record for `id`.
    pub fn get(&self, id: InstructionId, now: Timestamp) -> Option<&InstructionRecord> {
        self.queue
            .iter()
            .rev()
            .find(|r| r.record.id == id && now < r.expires_at)
            .map(|r| &r.record)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::ident::CorrelationId;
    use crate::instruction::{InstructionContext, InstructionStatus, Source, StageTimestamps};

    fn record(n: u64) -> InstructionRecord {
        InstructionRecord {
            id: InstructionId::from_raw(n),
            kind: "op".into(),
            payload: Value::Null,
            context: InstructionContext {
                correlation_id: CorrelationId::new("c"),
                created_at: 0,
                source: Source::Test,
                retry_count: 0,
            },
            status: InstructionStatus::Committed,
            timestamps: StageTimestamps::default(),
            result: Some(Value::Null),
            error: None,
            batch: None,
            resources: Vec::new(),
        }
    }

    #[test]
    fn records_expire_after_ttl() {
        let mut log = RetiredLog::new(8, 100);
        log.push(record(1), 0);
        log.push(record(2), 50);
        assert_eq!(log.visible(99).len(), 2);
        assert_eq!(log.visible(100).len(), 1);
        assert!(log.get(InstructionId::from_raw(1), 100).is_none());
        log.prune(150);
        assert!(log.queue.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut log = RetiredLog::new(2, 1_000);
        for n in 1..=3 {
            log.push(record(n), 0);
        }
        let ids: Vec<_> = log.visible(0).iter().map(|r| r.id.value()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let mut log = RetiredLog::new(0, 1_000);
        log.push(record(1), 0);
        assert!(log.visible(0).is_empty());
    }
}
