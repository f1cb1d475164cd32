//! Chunk iteration.
//!
//! [`ChunkIter`] is a cursor over the non-empty chunks of a query's matching
//! archetypes, in archetype creation order then chunk order, honoring the
//! query's [`ChunkFilter`]. It holds the query's access tokens for its whole
//! lifetime, so the column slices it hands out cannot race with another
//! iterator or lookup.
//!
//! [`World::par_for_each_chunk`] is the fork-join counterpart: one token
//! acquisition, then one [`ChunkView`] per chunk on the `rayon` pool.

use std::any::TypeId;
use std::ops::Range;

use rayon::prelude::*;

use crate::access::{AccessGuard, AccessMode};
use crate::archetype::{Archetype, ArchetypeId};
use crate::chunk::{Chunk, ChunkId};
use crate::component::{Component, ComponentKind, ComponentTypeId, SharedComponent, SharedValue};
use crate::entity::EntityId;
use crate::query::{ChunkFilter, MatchingArchetypeList, QueryId};
use crate::shared::SharedIndex;
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Column access helpers
// ---------------------------------------------------------------------------

fn column_index<T: 'static>(
    world: &World,
    guard: &AccessGuard<'_>,
    chunk: &Chunk,
    mode: AccessMode,
) -> Result<usize, EcsError> {
    let id = world.registry.require::<T>()?;
    world.expect_kind(id, ComponentKind::PerEntity)?;
    guard.check(&world.registry, id, mode)?;
    world
        .archetypes
        .require(chunk.archetype())?
        .column_of(id)
        .ok_or_else(|| EcsError::ComponentNotInChunk {
            component: world.registry.name_of(id),
        })
}

/// Read view of `T` in `chunk`.
///
/// # Safety
///
/// The caller must not let the slice outlive its borrow of whatever owns
/// `guard`, and must not hand out a mutable view of the same column while
/// the slice is live.
unsafe fn read_column<'a, T: Component>(
    world: &World,
    guard: &AccessGuard<'_>,
    chunk: &'a Chunk,
) -> Result<&'a [T], EcsError> {
    let column = column_index::<T>(world, guard, chunk, AccessMode::Read)?;
    Ok(unsafe { chunk.column_slice::<T>(column) })
}

/// Write view of `T` in `chunk`, stamping the column with `version`.
///
/// # Safety
///
/// As [`read_column`], and the caller must be the only one holding any
/// view of this column of `chunk` while the slice is live.
unsafe fn write_column<'a, T: Component>(
    world: &World,
    guard: &AccessGuard<'_>,
    chunk: &'a Chunk,
    version: u32,
) -> Result<&'a mut [T], EcsError> {
    let column = column_index::<T>(world, guard, chunk, AccessMode::Write)?;
    chunk.set_version(column, version);
    Ok(unsafe { chunk.column_slice_mut::<T>(column) })
}

fn shared_slot<T: 'static>(world: &World, chunk: &Chunk) -> Result<SharedIndex, EcsError> {
    let id = world.registry.require::<T>()?;
    world.expect_kind(id, ComponentKind::Shared)?;
    let slot = world
        .archetypes
        .require(chunk.archetype())?
        .shared_slot_of(id)
        .ok_or_else(|| EcsError::ComponentNotInChunk {
            component: world.registry.name_of(id),
        })?;
    Ok(chunk.shared_indices()[slot])
}

fn shared_value<'a, T: SharedComponent>(world: &'a World, chunk: &Chunk) -> Result<&'a T, EcsError> {
    let idx = shared_slot::<T>(world, chunk)?;
    world
        .shared
        .get_typed::<T>(idx)
        .ok_or_else(|| EcsError::ComponentNotInChunk {
            component: std::any::type_name::<T>().to_string(),
        })
}

fn column_version<T: 'static>(world: &World, chunk: &Chunk) -> Result<u32, EcsError> {
    let id = world.registry.require::<T>()?;
    world.expect_kind(id, ComponentKind::PerEntity)?;
    let column = world
        .archetypes
        .require(chunk.archetype())?
        .column_of(id)
        .ok_or_else(|| EcsError::ComponentNotInChunk {
            component: world.registry.name_of(id),
        })?;
    Ok(chunk.version(column))
}

fn assert_distinct<W: 'static, R: 'static>() {
    assert_ne!(
        TypeId::of::<W>(),
        TypeId::of::<R>(),
        "columns_mut needs two different component types"
    );
}

// ---------------------------------------------------------------------------
// ChunkIter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    NotStarted,
    /// Index into the matching list, then into that archetype's chunk list.
    At { entry: usize, chunk: usize },
    Exhausted,
}

/// Chunk found by a cursor walk, or the released chunk the walk ran into.
type Found<'w> = Result<Option<(usize, usize, &'w Chunk)>, ChunkId>;

/// Cursor over the chunks of one query.
pub struct ChunkIter<'w> {
    world: &'w World,
    list: &'w MatchingArchetypeList,
    /// Archetype of each matching-list entry, resolved at construction.
    archetypes: Vec<&'w Archetype>,
    filter: &'w ChunkFilter,
    guard: AccessGuard<'w>,
    /// Write stamp, captured at construction.
    version: u32,
    position: Position,
    current: Option<&'w Chunk>,
    /// Logical index of the first record of the current chunk.
    chunk_base: usize,
    /// False after an unfiltered seek under a filter.
    base_is_logical: bool,
    dangling: Option<ChunkId>,
}

impl<'w> ChunkIter<'w> {
    fn chunk_at(&self, entry: usize, chunk: usize) -> Result<&'w Chunk, ChunkId> {
        let id = self.archetypes[entry].chunks()[chunk];
        self.world.archetypes.chunk(id).ok_or(id)
    }

    /// The chunk under the cursor.
    pub fn current(&self) -> Option<&'w Chunk> {
        self.current
    }

    /// First visitable chunk at or after `(entry, chunk)`.
    fn find_from(&self, mut entry: usize, mut chunk: usize) -> Found<'w> {
        let entries = self.list.entries();
        while entry < self.archetypes.len() {
            let chunks = self.archetypes[entry].chunks();
            while chunk < chunks.len() {
                let candidate = self.chunk_at(entry, chunk)?;
                if candidate.count() > 0 && self.filter.matches(&entries[entry], candidate) {
                    return Ok(Some((entry, chunk, candidate)));
                }
                chunk += 1;
            }
            entry += 1;
            chunk = 0;
        }
        Ok(None)
    }

    fn settle(&mut self, found: Found<'w>) -> bool {
        match found {
            Ok(Some((entry, chunk, current))) => {
                self.position = Position::At { entry, chunk };
                self.current = Some(current);
                true
            }
            Ok(None) => {
                self.exhaust();
                false
            }
            Err(id) => {
                tracing::error!(chunk = ?id, "archetype chunk list names a released chunk");
                self.dangling = Some(id);
                self.exhaust();
                false
            }
        }
    }

    fn exhaust(&mut self) {
        self.position = Position::Exhausted;
        self.current = None;
    }

    fn reset(&mut self) {
        self.position = Position::NotStarted;
        self.current = None;
        self.chunk_base = 0;
        self.base_is_logical = true;
    }

    /// Advance to the next chunk. Returns `false` once exhausted.
    pub fn move_next(&mut self) -> bool {
        let (entry, chunk) = match self.position {
            Position::NotStarted => (0, 0),
            Position::At { entry, chunk } => {
                self.chunk_base += self.len();
                (entry, chunk + 1)
            }
            Position::Exhausted => return false,
        };
        let found = self.find_from(entry, chunk);
        self.settle(found)
    }

    /// Position on the chunk holding logical record `index` and return its
    /// slot there, or `None` (exhausting the cursor) when out of range.
    pub fn move_to_entity_index(&mut self, index: usize) -> Option<usize> {
        let resume = self.current.is_some() && self.base_is_logical && index >= self.chunk_base;
        if !resume {
            self.reset();
            if self.filter.is_none() && !self.skip_to_archetype_holding(index) {
                self.exhaust();
                return None;
            }
        }
        loop {
            if let Some(chunk) = self.current {
                if index < self.chunk_base + chunk.count() {
                    return Some(index - self.chunk_base);
                }
            }
            if !self.move_next() {
                return None;
            }
        }
    }

    /// Unfiltered fast path: jump over whole archetypes by record count.
    fn skip_to_archetype_holding(&mut self, index: usize) -> bool {
        let mut base = 0;
        for entry in 0..self.archetypes.len() {
            let count = self.archetypes[entry].entity_count();
            if index < base + count {
                let found = self.find_from(entry, 0);
                self.chunk_base = base;
                return self.settle(found);
            }
            base += count;
        }
        false
    }

    /// Entry, chunk position, chunk and first record index of the
    /// `index`-th chunk across all matching archetypes.
    fn locate_chunk(&self, index: usize) -> Result<Option<(usize, usize, &'w Chunk, usize)>, ChunkId> {
        let mut skipped = 0;
        let mut base = 0;
        for (entry, archetype) in self.archetypes.iter().enumerate() {
            let chunks = archetype.chunks().len();
            if index >= skipped + chunks {
                skipped += chunks;
                base += archetype.entity_count();
                continue;
            }
            let chunk = index - skipped;
            for before in 0..chunk {
                base += self.chunk_at(entry, before)?.count();
            }
            return Ok(Some((entry, chunk, self.chunk_at(entry, chunk)?, base)));
        }
        Ok(None)
    }

    /// Position on the `index`-th chunk of the matching archetypes.
    ///
    /// The filter is not consulted: the chunk may not pass it, and
    /// [`current_chunk_range`](Self::current_chunk_range) then counts
    /// unfiltered records.
    pub fn move_to_chunk_index(&mut self, index: usize) -> bool {
        self.reset();
        let found = match self.locate_chunk(index) {
            Ok(Some((entry, chunk, current, base))) => {
                self.chunk_base = base;
                self.base_is_logical = self.filter.is_none();
                Ok(Some((entry, chunk, current)))
            }
            Ok(None) => Ok(None),
            Err(id) => Err(id),
        };
        self.settle(found)
    }

    /// Logical record range of the current chunk (empty when not positioned).
    pub fn current_chunk_range(&self) -> Range<usize> {
        let len = self.len();
        self.chunk_base..self.chunk_base + len
    }

    pub fn chunk_id(&self) -> Option<ChunkId> {
        self.current().map(Chunk::id)
    }

    pub fn archetype_id(&self) -> Option<ArchetypeId> {
        self.current().map(Chunk::archetype)
    }

    /// Records in the current chunk.
    pub fn len(&self) -> usize {
        self.current().map_or(0, Chunk::count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Version stamped onto columns written through this iterator.
    pub fn write_version(&self) -> u32 {
        self.version
    }

    pub fn entities(&self) -> &[EntityId] {
        self.current().map_or(&[][..], Chunk::entities)
    }

    fn positioned(&self) -> Result<&'w Chunk, EcsError> {
        match (self.current, self.dangling) {
            (Some(chunk), _) => Ok(chunk),
            (None, Some(chunk)) => Err(EcsError::DanglingChunk { chunk }),
            (None, None) => Err(EcsError::NotPositioned),
        }
    }

    /// Values of `T` in the current chunk.
    pub fn column<T: Component>(&self) -> Result<&[T], EcsError> {
        let chunk = self.positioned()?;
        // SAFETY: the slice borrows `self`, which owns the guard; mutable
        // views need `&mut self`.
        unsafe { read_column(self.world, &self.guard, chunk) }
    }

    /// Mutable values of `T` in the current chunk. Stamps the column.
    pub fn column_mut<T: Component>(&mut self) -> Result<&mut [T], EcsError> {
        let chunk = self.positioned()?;
        // SAFETY: the slice mutably borrows `self`, which owns the write token.
        unsafe { write_column(self.world, &self.guard, chunk, self.version) }
    }

    /// `W` for writing and `R` for reading at the same time.
    ///
    /// # Panics
    ///
    /// Panics if `W` and `R` are the same type.
    pub fn columns_mut<W: Component, R: Component>(&mut self) -> Result<(&mut [W], &[R]), EcsError> {
        assert_distinct::<W, R>();
        let chunk = self.positioned()?;
        // SAFETY: as `column_mut`; the two columns are distinct.
        unsafe {
            let write = write_column(self.world, &self.guard, chunk, self.version)?;
            let read = read_column(self.world, &self.guard, chunk)?;
            Ok((write, read))
        }
    }

    /// Shared value of `T` for the current chunk.
    pub fn shared<T: SharedComponent>(&self) -> Result<&'w T, EcsError> {
        shared_value(self.world, self.positioned()?)
    }

    pub fn shared_index<T: 'static>(&self) -> Result<SharedIndex, EcsError> {
        shared_slot::<T>(self.world, self.positioned()?)
    }

    /// Change version of the current chunk's `T` column.
    pub fn column_version<T: 'static>(&self) -> Result<u32, EcsError> {
        column_version::<T>(self.world, self.positioned()?)
    }
}

impl std::fmt::Debug for ChunkIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkIter")
            .field("position", &self.position)
            .field("chunk_base", &self.chunk_base)
            .field("dangling", &self.dangling)
            .field("version", &self.version)
            .field("guard", &self.guard)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChunkView
// ---------------------------------------------------------------------------

/// One chunk handed to a [`World::par_for_each_chunk`] job.
pub struct ChunkView<'a> {
    world: &'a World,
    guard: &'a AccessGuard<'a>,
    chunk: &'a Chunk,
    version: u32,
}

impl<'a> ChunkView<'a> {
    pub fn chunk(&self) -> &'a Chunk {
        self.chunk
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk.id()
    }

    pub fn archetype_id(&self) -> ArchetypeId {
        self.chunk.archetype()
    }

    pub fn len(&self) -> usize {
        self.chunk.count()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn entities(&self) -> &'a [EntityId] {
        self.chunk.entities()
    }

    pub fn column<T: Component>(&self) -> Result<&[T], EcsError> {
        // SAFETY: the slice borrows the view, and no other job sees this chunk.
        unsafe { read_column(self.world, self.guard, self.chunk) }
    }

    pub fn column_mut<T: Component>(&mut self) -> Result<&mut [T], EcsError> {
        // SAFETY: the slice mutably borrows the view, and no other job sees
        // this chunk.
        unsafe { write_column(self.world, self.guard, self.chunk, self.version) }
    }

    /// See [`ChunkIter::columns_mut`].
    pub fn columns_mut<W: Component, R: Component>(&mut self) -> Result<(&mut [W], &[R]), EcsError> {
        assert_distinct::<W, R>();
        // SAFETY: as `column_mut`; the two columns are distinct.
        unsafe {
            let write = write_column(self.world, self.guard, self.chunk, self.version)?;
            let read = read_column(self.world, self.guard, self.chunk)?;
            Ok((write, read))
        }
    }

    pub fn shared<T: SharedComponent>(&self) -> Result<&'a T, EcsError> {
        shared_value(self.world, self.chunk)
    }

    pub fn shared_index<T: 'static>(&self) -> Result<SharedIndex, EcsError> {
        shared_slot::<T>(self.world, self.chunk)
    }

    pub fn column_version<T: 'static>(&self) -> Result<u32, EcsError> {
        column_version::<T>(self.world, self.chunk)
    }
}

// ---------------------------------------------------------------------------
// World iteration API
// ---------------------------------------------------------------------------

impl World {
    fn query_guard(&self, list: &MatchingArchetypeList) -> Result<AccessGuard<'_>, EcsError> {
        let query = list.query();
        AccessGuard::acquire(&self.access, &self.registry, &query.reads(), &query.writes())
    }

    /// Start iterating the chunks of `query`. Acquires the query's tokens.
    pub fn iter_chunks(&self, query: QueryId) -> Result<ChunkIter<'_>, EcsError> {
        let list = self.queries.list(query)?;
        let filter = self.queries.filter(query)?;
        let archetypes = list
            .entries()
            .iter()
            .map(|entry| self.archetypes.require(entry.archetype()))
            .collect::<Result<Vec<_>, _>>()?;
        let guard = self.query_guard(list)?;
        Ok(ChunkIter {
            world: self,
            list,
            archetypes,
            filter,
            guard,
            version: self.version(),
            position: Position::NotStarted,
            current: None,
            chunk_base: 0,
            base_is_logical: true,
            dangling: None,
        })
    }

    /// Run `f` on every chunk of `query` across the `rayon` pool.
    ///
    /// Stops at the first error a job returns.
    pub fn par_for_each_chunk<F>(&self, query: QueryId, f: F) -> Result<(), EcsError>
    where
        F: Fn(ChunkView<'_>) -> Result<(), EcsError> + Send + Sync,
    {
        let list = self.queries.list(query)?;
        let guard = self.query_guard(list)?;
        let chunks = self.filtered_chunks(query)?;
        let version = self.version();
        chunks.into_par_iter().try_for_each(|(_, chunk)| {
            f(ChunkView {
                world: self,
                guard: &guard,
                chunk,
                version,
            })
        })
    }

    /// Entity ids visited by `query`, in iteration order.
    pub fn collect_entities(&self, query: QueryId) -> Result<Vec<EntityId>, EcsError> {
        Ok(self
            .filtered_chunks(query)?
            .into_iter()
            .flat_map(|(_, chunk)| chunk.entities().iter().copied())
            .collect())
    }

    /// Values of `T` visited by `query`, in iteration order.
    pub fn collect_component<T: Component>(&self, query: QueryId) -> Result<Vec<T>, EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::PerEntity)?;
        let guard = AccessGuard::acquire(&self.access, &self.registry, &[id], &[])?;
        let chunks = self.filtered_chunks(query)?;
        let mut out = Vec::with_capacity(chunks.iter().map(|(_, c)| c.count()).sum());
        for (_, chunk) in chunks {
            // SAFETY: the slice is copied out before `guard` drops.
            out.extend_from_slice(unsafe { read_column::<T>(self, &guard, chunk)? });
        }
        Ok(out)
    }

    /// Shared value of `T` for every record `query` visits, in iteration order.
    ///
    /// `query` must name `T`.
    pub fn collect_shared<T: SharedComponent>(&self, query: QueryId) -> Result<Vec<T>, EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::Shared)?;
        if self.queries.list(query)?.position_of(id).is_none() {
            return Err(EcsError::AccessNotDeclared {
                component: self.registry.name_of(id),
                requested: AccessMode::Read,
            });
        }
        let chunks = self.filtered_chunks(query)?;
        let mut out = Vec::with_capacity(chunks.iter().map(|(_, c)| c.count()).sum());
        for (_, chunk) in chunks {
            let value = shared_value::<T>(self, chunk)?;
            out.extend(std::iter::repeat(value).take(chunk.count()).cloned());
        }
        Ok(out)
    }

    /// Scatter `values` over the `T` column of every record `query` visits.
    pub fn copy_from_component_slice<T: Component>(
        &self,
        query: QueryId,
        values: &[T],
    ) -> Result<(), EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::PerEntity)?;
        let guard = AccessGuard::acquire(&self.access, &self.registry, &[], &[id])?;
        let chunks = self.filtered_chunks(query)?;
        let expected: usize = chunks.iter().map(|(_, c)| c.count()).sum();
        if values.len() != expected {
            return Err(EcsError::LengthMismatch {
                expected,
                actual: values.len(),
            });
        }

        let version = self.version();
        let mut offset = 0;
        for (_, chunk) in chunks {
            // SAFETY: the write token is held and each chunk's slice is
            // dropped before the next is taken.
            let dst = unsafe { write_column::<T>(self, &guard, chunk, version)? };
            dst.copy_from_slice(&values[offset..offset + dst.len()]);
            offset += dst.len();
        }
        Ok(())
    }

    /// Hash of every record in archetype then chunk order.
    ///
    /// Covers archetype type names, entity ids, column bytes and shared
    /// values. Takes read tokens on every per-entity type.
    pub fn state_hash(&self) -> Result<blake3::Hash, EcsError> {
        let per_entity: Vec<ComponentTypeId> = (0..self.registry.len() as u32)
            .map(ComponentTypeId)
            .filter(|&id| matches!(self.registry.kind_of(id), Ok(ComponentKind::PerEntity)))
            .collect();
        let _guard = AccessGuard::acquire(&self.access, &self.registry, &per_entity, &[])?;

        let mut hasher = blake3::Hasher::new();
        for archetype in self.archetypes.archetypes() {
            if archetype.is_empty() {
                continue;
            }
            for &id in archetype.component_types() {
                hasher.update(self.registry.name_of(id).as_bytes());
                hasher.update(&[0]);
            }
            for &chunk_id in archetype.chunks() {
                let chunk = self.archetypes.live_chunk(chunk_id)?;
                for &idx in chunk.shared_indices() {
                    if let Some(value) = self.shared.get(idx) {
                        SharedValue::stable_hash(value, &mut hasher);
                    }
                }
                hasher.update(bytemuck::cast_slice(chunk.entities()));
                for column in 1..chunk.layout().columns().len() {
                    // SAFETY: read tokens on every per-entity type are held.
                    hasher.update(unsafe { chunk.column_bytes(column) });
                }
            }
        }
        Ok(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::ComponentBundle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Health(u32);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Team(u8);

    fn setup_world() -> World {
        // 256-byte chunks keep capacities small so tests span several chunks.
        let mut world = World::with_config(crate::config::StoreConfig { chunk_bytes: 256 }).unwrap();
        world.register_component::<Pos>("pos");
        world.register_component::<Vel>("vel");
        world.register_component::<Health>("health");
        world.register_shared_component::<Team>("team");
        world
    }

    fn spawn_mover(world: &mut World, x: f32) -> EntityId {
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Pos { x, y: 0.0 });
        b.add(world.registry(), Vel { dx: 1.0, dy: 2.0 });
        world.spawn_bundle(b).unwrap()
    }

    fn spawn_in_team(world: &mut World, x: f32, team: u8) -> EntityId {
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Pos { x, y: 0.0 });
        b.add_shared(world.registry(), Team(team));
        world.spawn_bundle(b).unwrap()
    }

    #[test]
    fn visits_every_record_once_across_chunks() {
        let mut world = setup_world();
        for i in 0..50 {
            spawn_mover(&mut world, i as f32);
        }
        let q = world.query().read::<Pos>().compile().unwrap();
        assert!(world.calculate_chunk_count(q).unwrap() > 1);

        let mut iter = world.iter_chunks(q).unwrap();
        let mut seen = Vec::new();
        let mut expected_base = 0;
        while iter.move_next() {
            assert_eq!(iter.current_chunk_range().start, expected_base);
            expected_base += iter.len();
            seen.extend(iter.column::<Pos>().unwrap().iter().map(|p| p.x as u32));
        }
        assert!(!iter.move_next());
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn column_mut_writes_and_stamps() {
        let mut world = setup_world();
        let e = spawn_mover(&mut world, 1.0);
        let v = world.advance_version();
        let q = world.query().write::<Pos>().read::<Vel>().compile().unwrap();

        let mut iter = world.iter_chunks(q).unwrap();
        while iter.move_next() {
            let (pos, vel) = iter.columns_mut::<Pos, Vel>().unwrap();
            for (p, v) in pos.iter_mut().zip(vel) {
                p.x += v.dx;
                p.y += v.dy;
            }
            assert_eq!(iter.column_version::<Pos>().unwrap(), v);
        }
        drop(iter);
        assert_eq!(world.get_component::<Pos>(e).unwrap(), Pos { x: 2.0, y: 2.0 });
    }

    #[test]
    fn undeclared_and_unpositioned_access_fail() {
        let mut world = setup_world();
        spawn_mover(&mut world, 0.0);
        let q = world.query().read::<Pos>().compile().unwrap();
        let mut iter = world.iter_chunks(q).unwrap();
        assert!(matches!(iter.column::<Pos>(), Err(EcsError::NotPositioned)));
        assert!(iter.entities().is_empty());
        assert!(iter.move_next());
        assert!(matches!(
            iter.column_mut::<Pos>(),
            Err(EcsError::AccessNotDeclared { .. })
        ));
        assert!(matches!(
            iter.column::<Vel>(),
            Err(EcsError::AccessNotDeclared { .. })
        ));
    }

    #[test]
    fn conflicting_iterators_fail_fast() {
        let mut world = setup_world();
        spawn_mover(&mut world, 0.0);
        let writer = world.query().write::<Pos>().compile().unwrap();
        let reader = world.query().read::<Pos>().compile().unwrap();

        let held = world.iter_chunks(writer).unwrap();
        assert!(matches!(
            world.iter_chunks(reader),
            Err(EcsError::ConcurrencyViolation {
                requested: AccessMode::Read,
                held: AccessMode::Write,
                ..
            })
        ));
        drop(held);
        let a = world.iter_chunks(reader).unwrap();
        let b = world.iter_chunks(reader).unwrap();
        drop((a, b));
        assert!(world.iter_chunks(writer).is_ok());
    }

    #[test]
    fn shared_filter_selects_chunks() {
        let mut world = setup_world();
        for i in 0..6 {
            spawn_in_team(&mut world, i as f32, (i % 2) as u8);
        }
        let q = world.query().read::<Pos>().read::<Team>().compile().unwrap();
        world.set_shared_filter(q, Team(1)).unwrap();

        let mut iter = world.iter_chunks(q).unwrap();
        let mut xs = Vec::new();
        while iter.move_next() {
            assert_eq!(iter.shared::<Team>().unwrap(), &Team(1));
            xs.extend(iter.column::<Pos>().unwrap().iter().map(|p| p.x));
        }
        assert_eq!(xs, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn change_filter_skips_untouched_chunks() {
        let mut world = setup_world();
        let a = spawn_in_team(&mut world, 0.0, 0);
        spawn_in_team(&mut world, 1.0, 1);
        let baseline = world.version();
        world.advance_version();
        world.set_component(a, Pos { x: 10.0, y: 0.0 }).unwrap();

        let pos = world.component_type_id::<Pos>().unwrap();
        let q = world.query().read::<Pos>().compile().unwrap();
        world.set_changed_filter(q, &[pos], baseline).unwrap();
        assert_eq!(world.calculate_length(q).unwrap(), 1);
        assert_eq!(world.collect_entities(q).unwrap(), vec![a]);
    }

    #[test]
    fn move_to_entity_index_unfiltered() {
        let mut world = setup_world();
        for i in 0..40 {
            spawn_mover(&mut world, i as f32);
        }
        world.spawn_with(Pos { x: 100.0, y: 0.0 }).unwrap();
        let q = world.query().read::<Pos>().compile().unwrap();
        let all = world.collect_component::<Pos>(q).unwrap();
        assert_eq!(all.len(), 41);

        let mut iter = world.iter_chunks(q).unwrap();
        for index in [0, 17, 39, 40, 5] {
            let slot = iter.move_to_entity_index(index).unwrap();
            assert!(iter.current_chunk_range().contains(&index));
            assert_eq!(iter.column::<Pos>().unwrap()[slot], all[index]);
        }
        assert_eq!(iter.move_to_entity_index(41), None);
        assert!(!iter.move_next());
    }

    #[test]
    fn move_to_entity_index_filtered() {
        let mut world = setup_world();
        for i in 0..30 {
            spawn_in_team(&mut world, i as f32, (i % 3) as u8);
        }
        let q = world.query().read::<Pos>().read::<Team>().compile().unwrap();
        world.set_shared_filter(q, Team(2)).unwrap();
        let filtered = world.collect_component::<Pos>(q).unwrap();
        assert_eq!(filtered.len(), 10);

        let mut iter = world.iter_chunks(q).unwrap();
        for index in [3, 9, 0] {
            let slot = iter.move_to_entity_index(index).unwrap();
            assert_eq!(iter.column::<Pos>().unwrap()[slot], filtered[index]);
        }
        assert_eq!(iter.move_to_entity_index(10), None);
    }

    #[test]
    fn move_to_chunk_index_walks_all_chunks() {
        let mut world = setup_world();
        for i in 0..50 {
            spawn_mover(&mut world, i as f32);
        }
        let q = world.query().read::<Pos>().compile().unwrap();
        let chunks = world.calculate_chunk_count(q).unwrap();
        let mut iter = world.iter_chunks(q).unwrap();
        assert!(iter.move_to_chunk_index(chunks - 1));
        assert_eq!(iter.current_chunk_range().end, 50);
        assert!(!iter.move_next());
        assert!(!iter.move_to_chunk_index(chunks));
        assert!(matches!(iter.column::<Pos>(), Err(EcsError::NotPositioned)));
    }

    #[test]
    fn move_to_chunk_index_ignores_the_filter() {
        let mut world = setup_world();
        let first = spawn_mover(&mut world, 0.0);
        for i in 1..50 {
            spawn_mover(&mut world, i as f32);
        }
        let last = spawn_in_team(&mut world, 50.0, 1);
        let last_chunk = world.resolve(last).unwrap().chunk;
        let q = world.query().read::<Pos>().compile().unwrap();
        let unfiltered = world.calculate_chunk_count(q).unwrap();
        assert!(unfiltered > 2);

        let since = world.version();
        world.advance_version();
        world.set_component(first, Pos { x: -1.0, y: 0.0 }).unwrap();
        let pos = world.component_type_id::<Pos>().unwrap();
        world.set_changed_filter(q, &[pos], since).unwrap();
        assert_eq!(world.calculate_chunk_count(q).unwrap(), 1);

        let mut iter = world.iter_chunks(q).unwrap();
        assert!(iter.move_to_chunk_index(unfiltered - 1));
        assert_eq!(iter.chunk_id(), Some(last_chunk));
        assert_eq!(iter.current_chunk_range(), 50..51);
        assert!(!iter.move_to_chunk_index(unfiltered));

        // Entity-index seeks count filtered records again.
        assert_eq!(iter.move_to_entity_index(0), Some(0));
        assert_eq!(iter.entities()[0], first);
        assert_eq!(iter.current_chunk_range().start, 0);
    }

    #[test]
    fn copy_from_component_slice_scatters() {
        let mut world = setup_world();
        for i in 0..20 {
            spawn_mover(&mut world, i as f32);
        }
        let q = world.query().read::<Pos>().compile().unwrap();
        let entities = world.collect_entities(q).unwrap();
        let values: Vec<Pos> = (0..20).map(|i| Pos { x: 0.0, y: i as f32 }).collect();

        assert!(matches!(
            world.copy_from_component_slice(q, &values[..5]),
            Err(EcsError::LengthMismatch { expected: 20, actual: 5 })
        ));
        world.copy_from_component_slice(q, &values).unwrap();
        for (e, v) in entities.iter().zip(&values) {
            assert_eq!(world.get_component::<Pos>(*e).unwrap(), *v);
        }
    }

    #[test]
    fn par_for_each_chunk_visits_all_chunks() {
        let mut world = setup_world();
        for i in 0..100 {
            spawn_mover(&mut world, i as f32);
        }
        let q = world.query().write::<Pos>().read::<Vel>().compile().unwrap();
        let visited = AtomicUsize::new(0);
        world
            .par_for_each_chunk(q, |mut view| {
                visited.fetch_add(view.len(), Ordering::Relaxed);
                let (pos, vel) = view.columns_mut::<Pos, Vel>()?;
                for (p, v) in pos.iter_mut().zip(vel) {
                    p.x += v.dx;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(visited.into_inner(), 100);

        let xs = world.collect_component::<Pos>(q).unwrap();
        let mut xs: Vec<u32> = xs.iter().map(|p| p.x as u32).collect();
        xs.sort_unstable();
        assert_eq!(xs, (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn par_for_each_chunk_propagates_errors() {
        let mut world = setup_world();
        spawn_mover(&mut world, 0.0);
        let q = world.query().read::<Pos>().compile().unwrap();
        let result = world.par_for_each_chunk(q, |mut view| {
            view.column_mut::<Pos>()?;
            Ok(())
        });
        assert!(matches!(result, Err(EcsError::AccessNotDeclared { .. })));
        // Tokens were released.
        assert!(world.iter_chunks(q).is_ok());
    }

    #[test]
    fn state_hash_tracks_contents() {
        let build = |x: f32| {
            let mut world = setup_world();
            spawn_mover(&mut world, x);
            spawn_in_team(&mut world, x, 3);
            world
        };
        let a = build(1.0).state_hash().unwrap();
        let b = build(1.0).state_hash().unwrap();
        let c = build(2.0).state_hash().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collect_shared_follows_record_order() {
        let mut world = setup_world();
        for i in 0..12 {
            spawn_in_team(&mut world, i as f32, (i % 3) as u8);
        }
        let q = world.query().read::<Pos>().read::<Team>().compile().unwrap();
        let entities = world.collect_entities(q).unwrap();
        let teams = world.collect_shared::<Team>(q).unwrap();
        assert_eq!(teams.len(), entities.len());
        for (entity, team) in entities.iter().zip(&teams) {
            assert_eq!(&world.get_shared_component::<Team>(*entity).unwrap(), team);
        }

        world.set_shared_filter(q, Team(2)).unwrap();
        assert_eq!(world.collect_shared::<Team>(q).unwrap(), vec![Team(2); 4]);
    }

    #[test]
    fn collect_shared_needs_the_type_in_the_query() {
        let mut world = setup_world();
        spawn_in_team(&mut world, 0.0, 1);
        let q = world.query().read::<Pos>().compile().unwrap();
        assert!(matches!(
            world.collect_shared::<Team>(q),
            Err(EcsError::AccessNotDeclared { .. })
        ));
    }

    #[test]
    fn state_hash_covers_shared_values() {
        let build = |team: u8| {
            let mut world = setup_world();
            spawn_in_team(&mut world, 1.0, team);
            world.state_hash().unwrap()
        };
        assert_eq!(build(3), build(3));
        assert_ne!(build(3), build(4));
    }

    #[test]
    fn state_hash_respects_held_writers() {
        let mut world = setup_world();
        spawn_mover(&mut world, 0.0);
        let q = world.query().write::<Pos>().compile().unwrap();
        let _iter = world.iter_chunks(q).unwrap();
        assert!(matches!(
            world.state_hash(),
            Err(EcsError::ConcurrencyViolation { .. })
        ));
    }
}
