// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Context builder: turns raw dispatch calls into fully formed instructions.
//!
//! Resource ids and the priority/timeout hints are resolved from the
//! catalogue once, here, and never recomputed. A panicking resource
//! function refuses the dispatch instead of unwinding into the caller.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalogue::{Catalogue, Operation};
use crate::clock::{Clock, Timestamp};
use crate::error::{panic_message, PipelineError};
use crate::ident::{
    normalize_resources, BatchId, CorrelationId, IdAllocator, InstructionId, ResourceId,
};
use crate::instruction::{
    BatchContext, BatchMode, Instruction, InstructionContext, InstructionRecord, InstructionStatus,
    Source, StageTimestamps,
};

/// Per-dispatch options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Submitter (defaults to [`Source::User`]).
    pub source: Source,
    /// Caller-supplied correlation id; generated when absent.
    pub correlation_id: Option<CorrelationId>,
}

impl DispatchOptions {
    /// Options with the given source.
    pub fn from_source(source: Source) -> Self {
        Self {
            source,
            correlation_id: None,
        }
    }
}

/// One member of a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Operation type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Handler payload.
    #[serde(default)]
    pub payload: Value,
}

impl BatchItem {
    /// Creates a batch item.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Builds instructions and allocates instruction/batch identifiers.
#[derive(Debug)]
pub struct ContextBuilder {
    catalogue: Arc<Catalogue>,
    clock: Arc<dyn Clock>,
    instruction_ids: IdAllocator,
    batch_ids: IdAllocator,
}

impl ContextBuilder {
    /// Creates a builder over `catalogue`, stamping times from `clock`.
    pub fn new(catalogue: Arc<Catalogue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalogue,
            clock,
            instruction_ids: IdAllocator::default(),
            batch_ids: IdAllocator::default(),
        }
    }

    /// Builds a standalone instruction in `Pending`.
    pub fn build_single(
        &mut self,
        kind: &str,
        payload: Value,
        options: &DispatchOptions,
    ) -> Result<Instruction, PipelineError> {
        let operation = self.resolve(kind)?;
        let resources = resources_of(kind, operation.as_ref(), &payload)?;
        let now = self.clock.now();
        let context = self.context_for(options, now, 0);
        Ok(self.assemble(kind, payload, context, operation, resources, None, now))
    }

    /// Builds every member of a batch, in submission order.
    ///
    /// All type names and resource ids are resolved before any identifier is
    /// allocated, so a refused batch consumes no ids. Member `i` receives
    /// `sequence_number = i`.
    pub fn build_batch(
        &mut self,
        items: Vec<BatchItem>,
        mode: BatchMode,
        options: &DispatchOptions,
    ) -> Result<(BatchId, Vec<Instruction>), PipelineError> {
        let resolved = items
            .iter()
            .map(|item| {
                let operation = self.resolve(&item.kind)?;
                let resources = resources_of(&item.kind, operation.as_ref(), &item.payload)?;
                Ok::<_, PipelineError>((operation, resources))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let now = self.clock.now();
        let batch_id = BatchId::from_raw(self.batch_ids.next_raw());
        let total = items.len();
        let correlation = options
            .correlation_id
            .clone()
            .unwrap_or_else(CorrelationId::generate);
        let built = items
            .into_iter()
            .zip(resolved)
            .enumerate()
            .map(|(seq, (item, (operation, resources)))| {
                let batch = BatchContext {
                    batch_id,
                    mode,
                    total_instructions: total,
                    sequence_number: seq,
                    start_time: now,
                };
                let context = InstructionContext {
                    correlation_id: correlation.clone(),
                    created_at: now,
                    source: options.source,
                    retry_count: 0,
                };
                self.assemble(
                    &item.kind,
                    item.payload,
                    context,
                    operation,
                    resources,
                    Some(batch),
                    now,
                )
            })
            .collect();
        Ok((batch_id, built))
    }

    /// Builds a fresh standalone attempt of `record`'s work.
    ///
    /// The new instruction keeps the correlation id and source and bumps
    /// `retry_count`.
    pub fn build_retry(&mut self, record: &InstructionRecord) -> Result<Instruction, PipelineError> {
        let operation = self.resolve(&record.kind)?;
        let resources = resources_of(&record.kind, operation.as_ref(), &record.payload)?;
        let now = self.clock.now();
        let context = InstructionContext {
            correlation_id: record.context.correlation_id.clone(),
            created_at: now,
            source: record.context.source,
            retry_count: record.context.retry_count.saturating_add(1),
        };
        Ok(self.assemble(
            &record.kind,
            record.payload.clone(),
            context,
            operation,
            resources,
            None,
            now,
        ))
    }

    fn resolve(&self, kind: &str) -> Result<Arc<dyn Operation>, PipelineError> {
        self.catalogue
            .get(kind)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownOperation(kind.to_owned()))
    }

    fn context_for(
        &self,
        options: &DispatchOptions,
        now: Timestamp,
        retry_count: u32,
    ) -> InstructionContext {
        InstructionContext {
            correlation_id: options
                .correlation_id
                .clone()
                .unwrap_or_else(CorrelationId::generate),
            created_at: now,
            source: options.source,
            retry_count,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &mut self,
        kind: &str,
        payload: Value,
        context: InstructionContext,
        operation: Arc<dyn Operation>,
        resources: Vec<ResourceId>,
        batch: Option<BatchContext>,
        now: Timestamp,
    ) -> Instruction {
        let id = InstructionId::from_raw(self.instruction_ids.next_raw());
        let mut timestamps = StageTimestamps::default();
        timestamps.stamp(InstructionStatus::Pending, now);
        Instruction {
            id,
            kind: kind.to_owned(),
            payload,
            context,
            status: InstructionStatus::Pending,
            timestamps,
            outcome: None,
            batch,
            resources,
            priority: operation.priority(),
            timeout: operation.timeout(),
            operation,
            settle: None,
        }
    }
}

/// Computes the normalized resource ids of `payload`, catching panics in
/// the operation's resource function.
fn resources_of(
    kind: &str,
    operation: &dyn Operation,
    payload: &Value,
) -> Result<Vec<ResourceId>, PipelineError> {
    let mut resources = panic::catch_unwind(AssertUnwindSafe(|| operation.resource_ids(payload)))
        .map_err(|panic| PipelineError::ResourcesUnavailable {
            kind: kind.to_owned(),
            message: panic_message(panic.as_ref()),
        })?;
    normalize_resources(&mut resources);
    Ok(resources)
}
