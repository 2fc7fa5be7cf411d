// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Identifier types for instructions, batches, and resources.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Pipeline-unique identifier for one instruction.
///
/// The pipeline issues monotonically increasing identifiers. Tests and tooling may construct values directly with
/// [`InstructionId::from_raw`].
///
/// # Invariants
/// - Zero (`InstructionId(0)`) is never allocated by a pipeline.
/// - An identifier is never reused for the lifetime of the pipeline that
///   allocated it.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct InstructionId(u64);

impl InstructionId {
    /// Constructs an `InstructionId` from a raw `u64` value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Identifier shared by every member of one submitted batch.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BatchId(u64);

impl BatchId {
    /// Constructs a `BatchId` from a raw `u64` value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Opaque name of a logical resource an instruction touches.
///
/// Resource identifiers are used purely for conflict detection: two
/// instructions that share any identifier never run at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ResourceId(Arc<str>);

impl ResourceId {
    /// Creates a resource identifier from any string-like value.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Correlation identifier carried in an instruction's context.
///
/// Retries of a failed instruction keep the correlation id of the original so
/// observers can group attempts together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wraps a caller-supplied correlation id.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh random correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic counter handing out non-zero raw identifiers.
///
/// Wraps at `u64::MAX` and resumes at `1`.
#[derive(Debug, Clone)]
pub(crate) struct IdAllocator {
    next: u64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdAllocator {
    pub(crate) fn next_raw(&mut self) -> u64 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        id
    }
}

/// Sorts and deduplicates a resource list in place.
pub(crate) fn normalize_resources(ids: &mut Vec<ResourceId>) {
    ids.sort();
    ids.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_never_yields_zero() {
        let mut alloc = IdAllocator { next: u64::MAX };
        assert_eq!(alloc.next_raw(), u64::MAX);
        assert_eq!(alloc.next_raw(), 1);
        assert_eq!(alloc.next_raw(), 2);
    }

    #[test]
    fn normalize_dedupes_and_sorts() {
        let mut ids = vec![
            ResourceId::from("task:2"),
            ResourceId::from("task:1"),
            ResourceId::from("task:2"),
        ];
        normalize_resources(&mut ids);
        assert_eq!(ids, vec![ResourceId::from("task:1"), ResourceId::from("task:2")]);
    }

    #[test]
    fn generated_correlation_ids_differ() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }
}
