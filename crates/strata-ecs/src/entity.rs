//! Record handles and where their records live.
//!
//! Every chunk keeps the owning [`EntityId`] of each record in its first
//! column, so ids are plain 8-byte values: a slot index in the low half and
//! a reuse counter in the high half. A destroyed index comes back with the
//! counter bumped, and the [`EntityTable`] rejects handles whose counter is
//! behind.
//!
//! The table maps each live index to the archetype, chunk and slot holding
//! its record. Swap-removes inside a chunk patch the moved record's slot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::archetype::ArchetypeId;
use crate::chunk::ChunkId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Handle to one record, stored as-is in the entity column of its chunk.
///
/// A zeroed column slot reads back as index 0, generation 0.
#[repr(transparent)]
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bytemuck_derive::Pod,
    bytemuck_derive::Zeroable,
)]
pub struct EntityId(u64);

impl EntityId {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// Slot in the entity table.
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// How many times `index` was reused before this handle was issued.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The value written into the entity column.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Issues entity ids for the [`EntityTable`].
///
/// Retired indices wait in a queue and are handed out oldest first, which
/// keeps the location table dense under spawn/destroy churn.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    retired: VecDeque<u32>,
    alive_count: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id: the oldest retired index if any, else a new index at
    /// generation 0.
    pub fn allocate(&mut self) -> EntityId {
        self.alive_count += 1;
        match self.retired.pop_front() {
            Some(index) => {
                self.alive[index as usize] = true;
                EntityId::new(index, self.generations[index as usize])
            }
            None => {
                let index = self.generations.len() as u32;
                self.generations.push(0);
                self.alive.push(true);
                EntityId::new(index, 0)
            }
        }
    }

    /// Retire `id` and bump its index's generation. `false` if `id` was not
    /// live.
    pub fn deallocate(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let idx = id.index() as usize;
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.retired.push_back(id.index());
        self.alive_count -= 1;
        true
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        let idx = id.index() as usize;
        idx < self.generations.len() && self.alive[idx] && self.generations[idx] == id.generation()
    }

    pub fn alive_count(&self) -> usize {
        self.alive_count
    }
}

// ---------------------------------------------------------------------------
// EntityLocation / EntityTable
// ---------------------------------------------------------------------------

/// Where an entity's record currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub chunk: ChunkId,
    /// Slot within the chunk, always `< chunk.count()`.
    pub slot: usize,
}

/// Allocator plus the index-addressed location of every live entity.
#[derive(Debug, Default)]
pub struct EntityTable {
    allocator: EntityAllocator,
    locations: Vec<Option<EntityLocation>>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id. Its location must be set before it is resolved.
    pub(crate) fn allocate(&mut self) -> EntityId {
        let id = self.allocator.allocate();
        let idx = id.index() as usize;
        if idx >= self.locations.len() {
            self.locations.resize(idx + 1, None);
        }
        id
    }

    pub(crate) fn set_location(&mut self, id: EntityId, location: EntityLocation) {
        self.locations[id.index() as usize] = Some(location);
    }

    /// Point an entity at a new slot without a generation check.
    ///
    /// Used when a swap-remove moves the last record of a chunk.
    pub(crate) fn set_slot(&mut self, id: EntityId, slot: usize) {
        if let Some(location) = self.locations[id.index() as usize].as_mut() {
            location.slot = slot;
        }
    }

    /// Resolve a live entity to its location.
    pub fn resolve(&self, id: EntityId) -> Result<EntityLocation, EcsError> {
        if !self.allocator.is_alive(id) {
            return Err(EcsError::StaleEntity { entity: id });
        }
        self.locations[id.index() as usize].ok_or(EcsError::StaleEntity { entity: id })
    }

    /// Retire `id`, returning the location its record occupied.
    pub(crate) fn free(&mut self, id: EntityId) -> Result<EntityLocation, EcsError> {
        let location = self.resolve(id)?;
        self.allocator.deallocate(id);
        self.locations[id.index() as usize] = None;
        Ok(location)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.allocator.is_alive(id)
    }

    pub fn len(&self) -> usize {
        self.allocator.alive_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
