// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! echo-pipeline: conflict-aware asynchronous instruction pipeline.
//!
//! Callers dispatch typed operations (standalone or as `ORDERED`/`ATOMIC`
//! batches) and get a future back. Each instruction moves through
//! `PENDING -> ISSUED -> EXECUTING -> RESPONDED -> {COMMITTED | FAILED}`:
//! the scheduler issues it once a concurrency slot is free and none of its
//! resource ids is locked, the executor runs its handler on a tokio task, the
//! reorder buffer holds batch members until their commit rule is met, and
//! write-back assigns the terminal status and settles the caller's future.
//!
//! Operation semantics (resource ids, handlers, pre-checks) come from an
//! injected [`Catalogue`].
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod catalogue;
mod clock;
/// Pipeline configuration and the config storage port.
pub mod config;
mod context;
mod error;
mod executor;
mod ident;
mod instruction;
mod pipeline;
mod reorder;
mod retention;
mod scheduler;
/// Payload-driven simulated operations for workload replay and load tests.
pub mod sim;
mod telemetry;
mod tracker;
mod writeback;

/// Operation registry consumed by the context builder and executor.
pub use catalogue::{Catalogue, FnOperation, HandlerFuture, Operation, ValidateFuture};
/// Clock port and implementations.
pub use clock::{Clock, ManualClock, SystemClock, Timestamp, TokioClock};
/// Pipeline tunables and config port.
pub use config::{ConfigError, ConfigService, ConfigStore, PipelineConfig};
/// Context builder and dispatch inputs.
pub use context::{BatchItem, ContextBuilder, DispatchOptions};
/// Error types delivered through tickets.
pub use error::{CatalogueError, HandlerError, PipelineError, TransitionError};
/// Identifier types.
pub use ident::{BatchId, CorrelationId, InstructionId, ResourceId};
/// Instruction model and state machine.
pub use instruction::{
    BatchContext, BatchMode, Instruction, InstructionContext, InstructionRecord,
    InstructionStatus, Outcome, Source, StageTimestamps,
};
/// Pipeline facade and caller handles.
pub use pipeline::{BatchTicket, Pipeline, PipelineStatus, Ticket};
/// Batch progress and outcome shapes.
pub use reorder::{BatchOutcome, BatchProgress};
/// Issue scheduler and its diagnostics.
pub use scheduler::{BlockReason, Blocked, Scheduler, SchedulerSnapshot};
/// Lifecycle event stream.
pub use telemetry::PipelineEvent;
/// Resource lock table.
pub use tracker::ResourceTracker;
/// Write-back totals.
pub use writeback::WriteBackTotals;
