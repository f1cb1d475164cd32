//! Archetypes and the chunk layout manager.
//!
//! An [`Archetype`] describes one exact set of component types: its
//! canonical type order, the per-column byte layout of its chunks, and the
//! list of chunks currently holding its records. The [`ArchetypeManager`]
//! interns archetypes by type set and owns every chunk of the world.
//!
//! Canonical order is per-entity types sorted by id, followed by shared types
//! sorted by id. Column `i + 1` of a chunk holds the `i`-th per-entity type;
//! column 0 is the entity column.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkBuffer, ChunkId, ChunkLayout};
use crate::component::{ComponentKind, ComponentTypeId, TypeRegistry};
use crate::entity::EntityId;
use crate::shared::SharedIndex;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype within the world. Assigned in creation order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Interned descriptor of one component-type combination.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    /// Canonical order: per-entity types, then shared types.
    types: Vec<ComponentTypeId>,
    per_entity: usize,
    layout: Arc<ChunkLayout>,
    /// Live chunks in allocation order. None of them is empty.
    chunks: Vec<ChunkId>,
    /// Chunks with free slots, per shared-index tuple, keyed by allocation
    /// sequence so the oldest is filled first.
    open: HashMap<Box<[SharedIndex]>, BTreeMap<u64, ChunkId>>,
    entity_count: usize,
}

impl Archetype {
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// All component types in canonical order.
    pub fn component_types(&self) -> &[ComponentTypeId] {
        &self.types
    }

    pub fn per_entity_types(&self) -> &[ComponentTypeId] {
        &self.types[..self.per_entity]
    }

    pub fn shared_types(&self) -> &[ComponentTypeId] {
        &self.types[self.per_entity..]
    }

    pub fn has_component(&self, id: ComponentTypeId) -> bool {
        self.column_of(id).is_some() || self.shared_slot_of(id).is_some()
    }

    /// Chunk column holding `id`, if it is a per-entity type of this archetype.
    pub fn column_of(&self, id: ComponentTypeId) -> Option<usize> {
        self.per_entity_types()
            .binary_search(&id)
            .ok()
            .map(|i| i + 1)
    }

    /// Position of `id` in each chunk's shared index list.
    pub fn shared_slot_of(&self, id: ComponentTypeId) -> Option<usize> {
        self.shared_types().binary_search(&id).ok()
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Records per chunk.
    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    pub fn chunks(&self) -> &[ChunkId] {
        &self.chunks
    }

    /// Live records across all chunks.
    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    /// Chunks that still have room, across all shared-value combinations.
    pub fn open_chunk_count(&self) -> usize {
        self.open.values().map(BTreeMap::len).sum()
    }

    fn first_open(&self, shared: &[SharedIndex]) -> Option<ChunkId> {
        self.open.get(shared)?.values().next().copied()
    }

    fn mark_open(&mut self, shared: &[SharedIndex], seq: u64, id: ChunkId) {
        self.open.entry(shared.into()).or_default().insert(seq, id);
    }

    fn mark_closed(&mut self, shared: &[SharedIndex], seq: u64) {
        if let Some(open) = self.open.get_mut(shared) {
            open.remove(&seq);
            if open.is_empty() {
                self.open.remove(shared);
            }
        }
    }
}

/// Result of removing a record from a chunk.
#[derive(Debug, Default)]
pub struct FreeOutcome {
    /// Entity moved into the freed slot by the swap-shrink.
    pub moved: Option<EntityId>,
    /// Shared indices of the chunk, set when the chunk emptied and was released.
    pub released: Option<Box<[SharedIndex]>>,
}

// ---------------------------------------------------------------------------
// ArchetypeManager
// ---------------------------------------------------------------------------

/// Interns archetypes and owns every chunk.
#[derive(Debug)]
pub struct ArchetypeManager {
    chunk_bytes: usize,
    archetypes: Vec<Archetype>,
    index: HashMap<Vec<ComponentTypeId>, ArchetypeId>,
    /// Slab indexed by `ChunkId`.
    chunks: Vec<Option<Chunk>>,
    /// Allocation sequence of each chunk slot, parallel to `chunks`.
    chunk_seq: Vec<u64>,
    next_seq: u64,
    free_chunk_ids: Vec<u32>,
    pool: Vec<ChunkBuffer>,
}

impl ArchetypeManager {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes,
            archetypes: Vec::new(),
            index: HashMap::new(),
            chunks: Vec::new(),
            chunk_seq: Vec::new(),
            next_seq: 0,
            free_chunk_ids: Vec::new(),
            pool: Vec::new(),
        }
    }

    /// Sort and deduplicate `types` into canonical archetype order.
    pub fn canonical_types(
        types: &[ComponentTypeId],
        registry: &TypeRegistry,
    ) -> Result<Vec<ComponentTypeId>, EcsError> {
        let mut per_entity = Vec::with_capacity(types.len());
        let mut shared = Vec::new();
        for &id in types {
            match registry.kind_of(id)? {
                ComponentKind::PerEntity => per_entity.push(id),
                ComponentKind::Shared => shared.push(id),
            }
        }
        per_entity.sort_unstable();
        per_entity.dedup();
        shared.sort_unstable();
        shared.dedup();
        per_entity.extend(shared);
        Ok(per_entity)
    }

    /// Look up the archetype for `types`, creating it when needed.
    ///
    /// Returns the id and whether it was newly created.
    pub fn get_or_create(
        &mut self,
        types: &[ComponentTypeId],
        registry: &TypeRegistry,
    ) -> Result<(ArchetypeId, bool), EcsError> {
        let canonical = Self::canonical_types(types, registry)?;
        if let Some(&id) = self.index.get(&canonical) {
            return Ok((id, false));
        }

        let per_entity = canonical
            .iter()
            .take_while(|&&id| registry.kind_of(id).ok() == Some(ComponentKind::PerEntity))
            .count();
        let columns: Vec<(usize, usize)> = canonical[..per_entity]
            .iter()
            .filter_map(|&id| registry.get_info(id))
            .map(|info| (info.size, info.align))
            .collect();
        let layout = ChunkLayout::compute(&columns, self.chunk_bytes)?;

        let id = ArchetypeId(self.archetypes.len() as u32);
        tracing::debug!(
            archetype = id.0,
            types = canonical.len(),
            capacity = layout.capacity(),
            "archetype created"
        );
        self.archetypes.push(Archetype {
            id,
            types: canonical.clone(),
            per_entity,
            layout: Arc::new(layout),
            chunks: Vec::new(),
            open: HashMap::new(),
            entity_count: 0,
        });
        self.index.insert(canonical, id);
        Ok((id, true))
    }

    /// Existing archetype for `types`, without creating one.
    pub fn find(&self, types: &[ComponentTypeId], registry: &TypeRegistry) -> Option<ArchetypeId> {
        let canonical = Self::canonical_types(types, registry).ok()?;
        self.index.get(&canonical).copied()
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index())
    }

    /// The archetype `id`, which must belong to this manager.
    pub(crate) fn require(&self, id: ArchetypeId) -> Result<&Archetype, EcsError> {
        self.archetype(id)
            .ok_or(EcsError::UnknownArchetype { archetype: id })
    }

    /// All archetypes in creation order.
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.index())?.as_ref()
    }

    pub(crate) fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(id.index())?.as_mut()
    }

    /// A chunk some table points at; released chunks are an error.
    pub(crate) fn live_chunk(&self, id: ChunkId) -> Result<&Chunk, EcsError> {
        self.chunk(id).ok_or(EcsError::DanglingChunk { chunk: id })
    }

    pub(crate) fn live_chunk_mut(&mut self, id: ChunkId) -> Result<&mut Chunk, EcsError> {
        self.chunk_mut(id).ok_or(EcsError::DanglingChunk { chunk: id })
    }

    /// Number of live chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len() - self.free_chunk_ids.len()
    }

    /// Released buffers waiting for reuse.
    pub fn pooled_chunk_count(&self) -> usize {
        self.pool.len()
    }

    /// Reserve a slot for `entity` in a chunk of `archetype` carrying `shared`.
    ///
    /// Returns the chunk, the slot, and whether the chunk was newly created
    /// (in which case it holds references on `shared` from now on).
    pub fn allocate_record(
        &mut self,
        archetype: ArchetypeId,
        shared: &[SharedIndex],
        entity: EntityId,
    ) -> (ChunkId, usize, bool) {
        let (chunk_id, created) = match self.archetypes[archetype.index()].first_open(shared) {
            Some(id) => (id, false),
            None => (self.create_chunk(archetype, shared), true),
        };

        let chunk = self.chunks[chunk_id.index()]
            .as_mut()
            .expect("open lists only hold live chunks");
        let slot = chunk.push(entity);
        let arch = &mut self.archetypes[archetype.index()];
        arch.entity_count += 1;
        if chunk.is_full() {
            arch.mark_closed(shared, self.chunk_seq[chunk_id.index()]);
        }
        (chunk_id, slot, created)
    }

    fn create_chunk(&mut self, archetype: ArchetypeId, shared: &[SharedIndex]) -> ChunkId {
        let pooled = !self.pool.is_empty();
        let buffer = self
            .pool
            .pop()
            .unwrap_or_else(|| ChunkBuffer::new(self.chunk_bytes));
        let id = match self.free_chunk_ids.pop() {
            Some(raw) => ChunkId(raw),
            None => {
                self.chunks.push(None);
                self.chunk_seq.push(0);
                ChunkId(self.chunks.len() as u32 - 1)
            }
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.chunk_seq[id.index()] = seq;

        let arch = &mut self.archetypes[archetype.index()];
        let chunk = Chunk::new(
            id,
            archetype,
            Arc::clone(&arch.layout),
            buffer,
            shared.into(),
        );
        arch.chunks.push(id);
        arch.mark_open(shared, seq, id);
        self.chunks[id.index()] = Some(chunk);
        tracing::debug!(archetype = archetype.0, chunk = id.0, pooled, "chunk allocated");
        id
    }

    /// Remove the record at `slot`, keeping the chunk dense.
    pub fn free_record(&mut self, chunk_id: ChunkId, slot: usize) -> Result<FreeOutcome, EcsError> {
        let chunk = self
            .chunks
            .get_mut(chunk_id.index())
            .and_then(Option::as_mut)
            .ok_or(EcsError::DanglingChunk { chunk: chunk_id })?;
        let archetype = chunk.archetype();
        let was_full = chunk.is_full();
        let moved = chunk.swap_remove(slot);
        let now_empty = chunk.is_empty();
        let seq = self.chunk_seq[chunk_id.index()];

        let arch = &mut self.archetypes[archetype.index()];
        arch.entity_count -= 1;
        if !now_empty {
            if was_full {
                arch.mark_open(chunk.shared_indices(), seq, chunk_id);
            }
            return Ok(FreeOutcome {
                moved,
                released: None,
            });
        }

        arch.mark_closed(chunk.shared_indices(), seq);
        if let Some(pos) = arch.chunks.iter().position(|&c| c == chunk_id) {
            arch.chunks.remove(pos);
        }
        let chunk = self.chunks[chunk_id.index()]
            .take()
            .ok_or(EcsError::DanglingChunk { chunk: chunk_id })?;
        let released: Box<[SharedIndex]> = chunk.shared_indices().into();
        self.free_chunk_ids.push(chunk_id.0);
        self.pool.push(chunk.into_buffer());
        tracing::debug!(
            archetype = archetype.0,
            chunk = chunk_id.0,
            pooled = self.pool.len(),
            "chunk released"
        );
        Ok(FreeOutcome {
            moved,
            released: Some(released),
        })
    }

    /// Copy one value between records of two different chunks.
    pub(crate) fn copy_value(
        &mut self,
        src: (ChunkId, usize, usize),
        dst: (ChunkId, usize, usize),
    ) {
        let (src_chunk, src_col, src_slot) = src;
        let (dst_chunk, dst_col, dst_slot) = dst;
        let (from, to) = self.pair_mut(src_chunk, dst_chunk);
        to.write_value_bytes(dst_col, dst_slot, from.value_bytes(src_col, src_slot));
    }

    fn pair_mut(&mut self, a: ChunkId, b: ChunkId) -> (&mut Chunk, &mut Chunk) {
        assert_ne!(a, b, "pair_mut needs two distinct chunks");
        let (lo, hi) = (a.index().min(b.index()), a.index().max(b.index()));
        let (left, right) = self.chunks.split_at_mut(hi);
        let lo_chunk = left[lo].as_mut().expect("live chunk");
        let hi_chunk = right[0].as_mut().expect("live chunk");
        if a.index() < b.index() {
            (lo_chunk, hi_chunk)
        } else {
            (hi_chunk, lo_chunk)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
