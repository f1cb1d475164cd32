//! Fixed-capacity chunk storage.
//!
//! A [`Chunk`] owns one 16-byte aligned byte arena holding up to `capacity`
//! records of a single archetype, laid out column-major as described by the
//! archetype's [`ChunkLayout`]. Column 0 is always the entity column.
//!
//! The arena is interior-mutable: column bytes may be written through a
//! shared `&Chunk` by a caller that holds the component's exclusive access
//! token (see [`crate::access`]). Everything else goes through `&mut Chunk`.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::archetype::ArchetypeId;
use crate::entity::EntityId;
use crate::shared::SharedIndex;
use crate::EcsError;

/// Alignment of every chunk buffer, and the maximum component alignment.
pub const CHUNK_ALIGN: usize = 16;

/// Column index of the entity ids within every chunk.
pub const ENTITY_COLUMN: usize = 0;

/// `true` when a column stamped with `version` changed after `required`.
///
/// Version 0 means "never written" and never counts as a change. The
/// comparison tolerates wrap-around of the world version.
pub fn did_change(version: u32, required: u32) -> bool {
    version != 0 && (version.wrapping_sub(required) as i32) > 0
}

// ---------------------------------------------------------------------------
// ChunkId
// ---------------------------------------------------------------------------

/// Identifier of a live chunk. Ids of released chunks are reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub(crate) u32);

impl ChunkId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ChunkLayout
// ---------------------------------------------------------------------------

/// Placement of one column inside a chunk buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub offset: usize,
    /// Bytes per record.
    pub size: usize,
    pub align: usize,
}

/// Column placement and record capacity shared by all chunks of an archetype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    capacity: usize,
    columns: Vec<ColumnLayout>,
    used_bytes: usize,
}

impl ChunkLayout {
    /// Lay out the entity column followed by `columns` (`(size, align)` per
    /// per-entity component) inside a buffer of `budget` bytes.
    ///
    /// Capacity starts at `budget / stride` and shrinks until the aligned
    /// columns fit.
    pub fn compute(columns: &[(usize, usize)], budget: usize) -> Result<Self, EcsError> {
        let mut all = Vec::with_capacity(columns.len() + 1);
        all.push((
            std::mem::size_of::<EntityId>(),
            std::mem::align_of::<EntityId>(),
        ));
        all.extend_from_slice(columns);

        let stride: usize = all.iter().map(|&(size, _)| size).sum();
        let mut capacity = budget / stride;
        while capacity > 0 {
            let (placed, used_bytes) = place_columns(&all, capacity);
            if used_bytes <= budget {
                return Ok(Self {
                    capacity,
                    columns: placed,
                    used_bytes,
                });
            }
            capacity -= 1;
        }
        Err(EcsError::ArchetypeTooLarge { stride, budget })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All columns, entity column first.
    pub fn columns(&self) -> &[ColumnLayout] {
        &self.columns
    }

    /// Bytes from the buffer base to the end of the last column.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Bytes per record across all columns.
    pub fn stride(&self) -> usize {
        self.columns.iter().map(|c| c.size).sum()
    }
}

fn place_columns(columns: &[(usize, usize)], capacity: usize) -> (Vec<ColumnLayout>, usize) {
    let mut offset = 0;
    let mut placed = Vec::with_capacity(columns.len());
    for &(size, align) in columns {
        offset = align_up(offset, align);
        placed.push(ColumnLayout {
            offset,
            size,
            align,
        });
        offset += size * capacity;
    }
    (placed, offset)
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// ChunkBuffer
// ---------------------------------------------------------------------------

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Block([u8; CHUNK_ALIGN]);

const _: () = assert!(std::mem::size_of::<Block>() == CHUNK_ALIGN);
const _: () = assert!(std::mem::align_of::<Block>() == CHUNK_ALIGN);

/// Aligned, interior-mutable byte arena. Pooled by the archetype manager.
pub(crate) struct ChunkBuffer {
    blocks: Box<[UnsafeCell<Block>]>,
}

// SAFETY: bytes are only written through `&mut Chunk`, or through `&Chunk`
// by a holder of the column's exclusive access token. Readers through
// `&Chunk` hold a read token, which excludes writers. Pooled buffers are
// only touched through `&mut ArchetypeManager`.
unsafe impl Sync for ChunkBuffer {}

impl ChunkBuffer {
    pub(crate) fn new(bytes: usize) -> Self {
        let blocks = bytes.div_ceil(CHUNK_ALIGN);
        Self {
            blocks: (0..blocks)
                .map(|_| UnsafeCell::new(Block([0; CHUNK_ALIGN])))
                .collect(),
        }
    }

    pub(crate) fn len_bytes(&self) -> usize {
        self.blocks.len() * CHUNK_ALIGN
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.blocks.as_ptr()).cast::<u8>()
    }
}

impl fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("bytes", &self.len_bytes())
            .finish()
    }
}

fn typed<T: bytemuck::Pod>(bytes: &[u8], count: usize) -> &[T] {
    if std::mem::size_of::<T>() == 0 {
        // SAFETY: a dangling, well-aligned pointer is valid for any number of
        // zero-sized elements.
        unsafe { std::slice::from_raw_parts(NonNull::<T>::dangling().as_ptr(), count) }
    } else {
        bytemuck::cast_slice(bytes)
    }
}

fn typed_mut<T: bytemuck::Pod>(bytes: &mut [u8], count: usize) -> &mut [T] {
    if std::mem::size_of::<T>() == 0 {
        // SAFETY: as in `typed`.
        unsafe { std::slice::from_raw_parts_mut(NonNull::<T>::dangling().as_ptr(), count) }
    } else {
        bytemuck::cast_slice_mut(bytes)
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A fixed-capacity block of records of one archetype.
pub struct Chunk {
    id: ChunkId,
    archetype: ArchetypeId,
    layout: Arc<ChunkLayout>,
    buffer: ChunkBuffer,
    count: usize,
    /// One per column; the entity column's slot stays 0.
    versions: Box<[AtomicU32]>,
    shared: Box<[SharedIndex]>,
}

impl Chunk {
    pub(crate) fn new(
        id: ChunkId,
        archetype: ArchetypeId,
        layout: Arc<ChunkLayout>,
        buffer: ChunkBuffer,
        shared: Box<[SharedIndex]>,
    ) -> Self {
        assert!(
            buffer.len_bytes() >= layout.used_bytes(),
            "chunk buffer of {} bytes cannot hold a {}-byte layout",
            buffer.len_bytes(),
            layout.used_bytes()
        );
        let versions = (0..layout.columns().len())
            .map(|_| AtomicU32::new(0))
            .collect();
        Self {
            id,
            archetype,
            layout,
            buffer,
            count: 0,
            versions,
            shared,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    /// Number of live records.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.layout.capacity()
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Shared value indices, one per shared type of the archetype.
    pub fn shared_indices(&self) -> &[SharedIndex] {
        &self.shared
    }

    /// Entity ids of the live records, in slot order.
    pub fn entities(&self) -> &[EntityId] {
        // SAFETY: the entity column is only written through `&mut self`.
        unsafe { self.column_slice::<EntityId>(ENTITY_COLUMN) }
    }

    /// Change version of `column` (0 = never written).
    pub fn version(&self, column: usize) -> u32 {
        self.versions[column].load(Ordering::Acquire)
    }

    pub(crate) fn set_version(&self, column: usize, version: u32) {
        self.versions[column].store(version, Ordering::Release);
    }

    /// Stamp every component column, as done when records are moved in.
    pub(crate) fn stamp_all(&self, version: u32) {
        for column in 1..self.versions.len() {
            self.set_version(column, version);
        }
    }

    // -- raw views ---------------------------------------------------------

    fn column_range(&self, column: usize) -> (usize, usize) {
        let col = self.layout.columns()[column];
        (col.offset, col.size * self.count)
    }

    /// Column bytes of the live records.
    ///
    /// # Safety
    ///
    /// No mutable view of `column` may be live for the returned lifetime.
    pub(crate) unsafe fn column_bytes(&self, column: usize) -> &[u8] {
        let (offset, len) = self.column_range(column);
        debug_assert!(offset + len <= self.buffer.len_bytes());
        std::slice::from_raw_parts(self.buffer.base().add(offset), len)
    }

    /// Typed read view of `column`.
    ///
    /// # Safety
    ///
    /// `T` must be the column's component type, and no mutable view of
    /// `column` may be live for the returned lifetime.
    pub(crate) unsafe fn column_slice<T: bytemuck::Pod>(&self, column: usize) -> &[T] {
        debug_assert_eq!(self.layout.columns()[column].size, std::mem::size_of::<T>());
        typed(self.column_bytes(column), self.count)
    }

    /// Typed write view of `column` through a shared reference.
    ///
    /// # Safety
    ///
    /// `T` must be the column's component type, and the caller must have
    /// exclusive access to `column` of this chunk for the returned lifetime.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn column_slice_mut<T: bytemuck::Pod>(&self, column: usize) -> &mut [T] {
        debug_assert_eq!(self.layout.columns()[column].size, std::mem::size_of::<T>());
        let (offset, len) = self.column_range(column);
        debug_assert!(offset + len <= self.buffer.len_bytes());
        let bytes = std::slice::from_raw_parts_mut(self.buffer.base().add(offset), len);
        typed_mut(bytes, self.count)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: `&mut self` excludes every other view of the buffer.
        unsafe { std::slice::from_raw_parts_mut(self.buffer.base(), self.buffer.len_bytes()) }
    }

    /// Typed write view of `column` with borrowck-proven exclusivity.
    pub(crate) fn column_exclusive<T: bytemuck::Pod>(&mut self, column: usize) -> &mut [T] {
        // SAFETY: `&mut self` is exclusive access to every column.
        unsafe { self.column_slice_mut(column) }
    }

    /// Bytes of one value.
    pub(crate) fn value_bytes(&mut self, column: usize, slot: usize) -> &[u8] {
        self.value_bytes_mut(column, slot)
    }

    pub(crate) fn value_bytes_mut(&mut self, column: usize, slot: usize) -> &mut [u8] {
        assert!(slot < self.count, "slot {slot} out of range ({})", self.count);
        let col = self.layout.columns()[column];
        let start = col.offset + slot * col.size;
        &mut self.bytes_mut()[start..start + col.size]
    }

    pub(crate) fn write_value_bytes(&mut self, column: usize, slot: usize, bytes: &[u8]) {
        self.value_bytes_mut(column, slot).copy_from_slice(bytes);
    }

    // -- record management -------------------------------------------------

    /// Reserve the next slot for `entity`. Component bytes are left as-is.
    pub(crate) fn push(&mut self, entity: EntityId) -> usize {
        assert!(!self.is_full(), "push into a full chunk {:?}", self.id);
        let slot = self.count;
        self.count += 1;
        self.column_exclusive::<EntityId>(ENTITY_COLUMN)[slot] = entity;
        slot
    }

    /// Zero every component column of `slot`.
    pub(crate) fn zero_record(&mut self, slot: usize) {
        for column in 1..self.layout.columns().len() {
            self.value_bytes_mut(column, slot).fill(0);
        }
    }

    /// Remove `slot` by moving the last record into it.
    ///
    /// Returns the entity that now occupies `slot`, if one was moved.
    pub(crate) fn swap_remove(&mut self, slot: usize) -> Option<EntityId> {
        assert!(slot < self.count, "slot {slot} out of range ({})", self.count);
        let last = self.count - 1;
        let moved = if slot != last {
            let columns = self.layout.columns().to_vec();
            let bytes = self.bytes_mut();
            for col in columns.iter().filter(|c| c.size > 0) {
                let src = col.offset + last * col.size;
                bytes.copy_within(src..src + col.size, col.offset + slot * col.size);
            }
            Some(self.entities()[slot])
        } else {
            None
        };
        self.count -= 1;
        moved
    }

    /// Give the arena back for pooling.
    pub(crate) fn into_buffer(self) -> ChunkBuffer {
        self.buffer
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("archetype", &self.archetype)
            .field("count", &self.count)
            .field("capacity", &self.capacity())
            .field("shared", &self.shared)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
