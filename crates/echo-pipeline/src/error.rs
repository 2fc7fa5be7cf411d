// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Error types surfaced through instruction and batch handles.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::ident::{BatchId, InstructionId};
use crate::instruction::InstructionStatus;

/// Failure reported by an operation handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The handler's own operation failed.
    #[error("{0}")]
    Failed(String),
    /// The handler did not settle within the operation's timeout hint.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
    /// The handler panicked while building or running its future.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// No tokio runtime was available to run the handler on.
    #[error("no tokio runtime to run the handler on")]
    NoRuntime,
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Error delivered to the caller of `dispatch` / `dispatch_batch`.
///
/// Every variant is attached to a specific instruction (or batch). The
/// pipeline never raises these synchronously; they only arrive through a
/// ticket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// No operation with this type name is registered in the catalogue.
    #[error("operation not registered: {0}")]
    UnknownOperation(String),
    /// The operation's pre-check rejected the instruction before execution.
    #[error("instruction {id} ({kind}) rejected by validation")]
    ValidationFailed {
        /// Rejected instruction.
        id: InstructionId,
        /// Operation type name.
        kind: String,
    },
    /// The handler ran and failed.
    #[error("instruction {id} ({kind}) failed: {source}")]
    Handler {
        /// Failed instruction.
        id: InstructionId,
        /// Operation type name.
        kind: String,
        /// Handler-level cause.
        #[source]
        source: HandlerError,
    },
    /// An atomic batch member rolled back because a sibling failed.
    #[error("instruction {id} aborted: batch {batch} rolled back after {cause} failed")]
    BatchAborted {
        /// Member forced to fail.
        id: InstructionId,
        /// Batch that rolled back.
        batch: BatchId,
        /// Sibling whose failure triggered the rollback.
        cause: InstructionId,
    },
    /// The instruction was cancelled while still pending.
    #[error("instruction {id} cancelled before issue")]
    Cancelled {
        /// Cancelled instruction.
        id: InstructionId,
    },
    /// The operation's resource function panicked; nothing was enqueued.
    #[error("resource ids of {kind} could not be computed: {message}")]
    ResourcesUnavailable {
        /// Operation type name.
        kind: String,
        /// Panic message.
        message: String,
    },
    /// The pipeline went away before the handle was settled.
    #[error("pipeline closed before the instruction settled")]
    Closed,
}

impl PipelineError {
    /// Returns the instruction the error is attached to, when there is one.
    pub fn instruction(&self) -> Option<InstructionId> {
        match self {
            Self::ValidationFailed { id, .. }
            | Self::Handler { id, .. }
            | Self::BatchAborted { id, .. }
            | Self::Cancelled { id } => Some(*id),
            Self::UnknownOperation(_) | Self::ResourcesUnavailable { .. } | Self::Closed => None,
        }
    }

    /// True for errors synthesized by rollback rather than by the instruction itself.
    pub fn is_batch_aborted(&self) -> bool {
        matches!(self, Self::BatchAborted { .. })
    }
}

/// Illegal status change attempted on an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("instruction {id}: illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    /// Instruction whose state machine was violated.
    pub id: InstructionId,
    /// Current status.
    pub from: InstructionStatus,
    /// Requested status.
    pub to: InstructionStatus,
}

/// Error raised while building an operation catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogueError {
    /// An operation with this name is already registered.
    #[error("duplicate operation name: {0}")]
    DuplicateOperation(String),
    /// Operation names must be non-empty.
    #[error("operation name must not be empty")]
    EmptyName,
}
