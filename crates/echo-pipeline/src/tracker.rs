// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Resource tracker: which resource ids are held by in-flight instructions.
//!
//! Locks are exclusive; there is no reader/writer distinction. Each held id
//! remembers its holder so blocked instructions can report who blocks them.

use std::collections::HashMap;

use crate::ident::{InstructionId, ResourceId};

/// Set of currently locked resource ids with their holders.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    held: HashMap<ResourceId, InstructionId>,
}

impl ResourceTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when none of `ids` is held.
    pub fn is_free(&self, ids: &[ResourceId]) -> bool {
        ids.iter().all(|id| !self.held.contains_key(id))
    }

    /// First held id among `ids`, with its holder.
    pub fn first_conflict(&self, ids: &[ResourceId]) -> Option<(&ResourceId, InstructionId)> {
        ids.iter()
            .find_map(|id| self.held.get_key_value(id).map(|(k, owner)| (k, *owner)))
    }

    /// Marks every id in `ids` as held by `owner`.
    ///
    /// Callers must have checked [`ResourceTracker::is_free`] in the same
    /// critical section.
    pub fn acquire(&mut self, owner: InstructionId, ids: &[ResourceId]) {
        for id in ids {
            let prev = self.held.insert(id.clone(), owner);
            debug_assert!(
                prev.is_none() || prev == Some(owner),
                "resource {id} acquired twice"
            );
        }
    }

    /// Releases the ids in `ids` held by `owner`; returns how many were released.
    ///
    /// Ids held by another instruction are left untouched.
    pub fn release(&mut self, owner: InstructionId, ids: &[ResourceId]) -> usize {
        let mut released = 0;
        for id in ids {
            if self.held.get(id) == Some(&owner) {
                self.held.remove(id);
                released += 1;
            }
        }
        released
    }

    /// Holder of `id`, if locked.
    pub fn holder(&self, id: &ResourceId) -> Option<InstructionId> {
        self.held.get(id).copied()
    }

    /// True when `id` is locked.
    pub fn is_locked(&self, id: &ResourceId) -> bool {
        self.held.contains_key(id)
    }

    /// Number of locked ids.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// True when nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Iterates locked ids with their holders (unordered).
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, InstructionId)> {
        self.held.iter().map(|(k, v)| (k, *v))
    }
}
