//! Strata ECS -- chunked, columnar archetype store.
//!
//! Records ("entities") that share the exact same set of component types live
//! in the same [`Archetype`](archetype::Archetype). Each archetype owns a list
//! of fixed-capacity [`Chunk`](chunk::Chunk)s whose bytes are laid out
//! column-major: every value of a component type is contiguous inside its
//! chunk. Queries resolve to a cached, incrementally maintained list of
//! matching archetypes, and a cursor-style [`ChunkIter`](iter::ChunkIter)
//! walks their chunks with optional shared-value or change-version filters.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[repr(C)]
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! struct Position { x: f32, y: f32 }
//!
//! #[repr(C)]
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! world.register_component::<Position>("position");
//! world.register_component::<Velocity>("velocity");
//!
//! let mut bundle = ComponentBundle::new();
//! bundle.add(world.registry(), Position { x: 0.0, y: 0.0 });
//! bundle.add(world.registry(), Velocity { dx: 1.0, dy: 0.0 });
//! let entity = world.spawn_bundle(bundle).unwrap();
//!
//! let movers = world.query().write::<Position>().read::<Velocity>().compile().unwrap();
//! let mut iter = world.iter_chunks(movers).unwrap();
//! while iter.move_next() {
//!     let (positions, velocities) = iter.columns_mut::<Position, Velocity>().unwrap();
//!     for (pos, vel) in positions.iter_mut().zip(velocities) {
//!         pos.x += vel.dx;
//!         pos.y += vel.dy;
//!     }
//! }
//! drop(iter);
//!
//! assert_eq!(world.get_component::<Position>(entity).unwrap(), Position { x: 1.0, y: 0.0 });
//! ```

#![deny(unsafe_code)]

pub mod access;
pub mod archetype;
#[allow(unsafe_code)]
pub mod chunk;
pub mod component;
pub mod config;
pub mod entity;
#[allow(unsafe_code)]
pub mod iter;
#[allow(unsafe_code)]
pub mod lookup;
pub mod query;
pub mod shared;
pub mod world;

use crate::access::AccessMode;
use crate::archetype::ArchetypeId;
use crate::chunk::ChunkId;
use crate::component::ComponentKind;
use crate::entity::EntityId;
use crate::query::QueryId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A single record of the requested type set does not fit in one chunk.
    #[error("record stride of {stride} bytes exceeds the chunk budget of {budget} bytes")]
    ArchetypeTooLarge { stride: usize, budget: usize },

    /// A query requires and excludes the same component type.
    #[error("query both requires and excludes component '{component}'")]
    ContradictoryQuery { component: String },

    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: EntityId },

    /// A read/write or write/write overlap on the same component type.
    #[error("cannot acquire {requested} access to component '{component}': {held} access is already held")]
    ConcurrencyViolation {
        component: String,
        requested: AccessMode,
        held: AccessMode,
    },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered")]
    UnknownComponent { name: String },

    /// The entity is alive but does not carry the component.
    #[error("entity {entity:?} has no component '{component}'")]
    MissingComponent { entity: EntityId, component: String },

    /// The iterator's current chunk has no column for the component.
    #[error("current chunk has no component '{component}'")]
    ComponentNotInChunk { component: String },

    /// Column access that the query (or lookup) did not declare.
    #[error("{requested} access to component '{component}' was not declared")]
    AccessNotDeclared {
        component: String,
        requested: AccessMode,
    },

    /// A filter that cannot be attached to the query.
    #[error("invalid filter: {reason}")]
    InvalidFilter { reason: String },

    /// The query id was never compiled or has been released.
    #[error("query {query:?} does not exist")]
    UnknownQuery { query: QueryId },

    /// Bulk copy input does not match the query's record count.
    #[error("expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Shared/per-entity misuse of a component type.
    #[error("component '{component}' is registered as {actual}, not {expected}")]
    KindMismatch {
        component: String,
        expected: ComponentKind,
        actual: ComponentKind,
    },

    /// An archetype with shared types needs values for them.
    #[error("archetype requires a value for shared component '{component}'")]
    SharedValueRequired { component: String },

    /// Column access before `move_next` positioned the iterator on a chunk.
    #[error("iterator is not positioned on a chunk")]
    NotPositioned,

    /// The archetype id was issued by a different world.
    #[error("archetype {archetype:?} does not exist in this world")]
    UnknownArchetype { archetype: ArchetypeId },

    /// A location or matching list points at a chunk that was released.
    #[error("chunk {chunk:?} is referenced but has been released")]
    DanglingChunk { chunk: ChunkId },

    /// Rejected store configuration.
    #[error("invalid store configuration: {reason}")]
    InvalidConfig { reason: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::access::AccessMode;
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::chunk::{Chunk, ChunkId};
    pub use crate::component::{
        Component, ComponentInfo, ComponentKind, ComponentTypeId, SharedComponent, TypeRegistry,
    };
    pub use crate::config::StoreConfig;
    pub use crate::entity::{EntityId, EntityLocation};
    pub use crate::iter::{ChunkIter, ChunkView};
    pub use crate::lookup::{ComponentLookup, ComponentLookupMut};
    pub use crate::query::{ChunkFilter, QueryBuilder, QueryDesc, QueryId};
    pub use crate::shared::SharedIndex;
    pub use crate::world::{ComponentBundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
