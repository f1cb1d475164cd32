//! Random access to per-entity values by [`EntityId`].
//!
//! A lookup resolves the entity's `(chunk, slot)` through the entity table
//! and indexes the column directly. Like iterators, lookups hold an access
//! token on their component type for as long as they live.

use std::fmt;
use std::marker::PhantomData;

use crate::access::AccessGuard;
use crate::chunk::Chunk;
use crate::component::{Component, ComponentKind, ComponentTypeId};
use crate::entity::EntityId;
use crate::world::World;
use crate::EcsError;

impl World {
    /// Chunk, column and slot of `entity`'s value of `id`.
    fn locate_value(&self, entity: EntityId, id: ComponentTypeId) -> Result<(&Chunk, usize, usize), EcsError> {
        let location = self.resolve(entity)?;
        let column = self
            .archetypes
            .archetype(location.archetype)
            .and_then(|arch| arch.column_of(id))
            .ok_or_else(|| EcsError::MissingComponent {
                entity,
                component: self.registry.name_of(id),
            })?;
        let chunk = self.archetypes.live_chunk(location.chunk)?;
        Ok((chunk, column, location.slot))
    }

    fn lookup_guard<T: Component>(&self, write: bool) -> Result<(ComponentTypeId, AccessGuard<'_>), EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::PerEntity)?;
        let guard = if write {
            AccessGuard::acquire(&self.access, &self.registry, &[], &[id])?
        } else {
            AccessGuard::acquire(&self.access, &self.registry, &[id], &[])?
        };
        Ok((id, guard))
    }

    /// Read-only lookup of `T`. Holds a read token until dropped.
    pub fn component_lookup<T: Component>(&self) -> Result<ComponentLookup<'_, T>, EcsError> {
        let (id, guard) = self.lookup_guard::<T>(false)?;
        Ok(ComponentLookup {
            world: self,
            id,
            _guard: guard,
            _marker: PhantomData,
        })
    }

    /// Read-write lookup of `T`. Holds the write token until dropped.
    pub fn component_lookup_mut<T: Component>(&self) -> Result<ComponentLookupMut<'_, T>, EcsError> {
        let (id, guard) = self.lookup_guard::<T>(true)?;
        Ok(ComponentLookupMut {
            world: self,
            id,
            version: self.version(),
            _guard: guard,
            _marker: PhantomData,
        })
    }

    /// Copy of `entity`'s `T`, read under a momentary read token.
    pub fn get_component<T: Component>(&self, entity: EntityId) -> Result<T, EcsError> {
        let lookup = self.component_lookup::<T>()?;
        lookup.get(entity).copied()
    }
}

// ---------------------------------------------------------------------------
// ComponentLookup
// ---------------------------------------------------------------------------

/// Shared random access to one component type.
pub struct ComponentLookup<'w, T: Component> {
    world: &'w World,
    id: ComponentTypeId,
    _guard: AccessGuard<'w>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> ComponentLookup<'_, T> {
    pub fn get(&self, entity: EntityId) -> Result<&T, EcsError> {
        let (chunk, column, slot) = self.world.locate_value(entity, self.id)?;
        // SAFETY: the read token on `T` is held while `self` lives.
        Ok(&unsafe { chunk.column_slice::<T>(column) }[slot])
    }

    /// Whether `entity` is live and carries `T`.
    pub fn has(&self, entity: EntityId) -> bool {
        self.world.locate_value(entity, self.id).is_ok()
    }

    pub fn exists(&self, entity: EntityId) -> bool {
        self.world.exists(entity)
    }
}

impl<T: Component> fmt::Debug for ComponentLookup<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentLookup")
            .field("component", &self.world.registry.name_of(self.id))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentLookupMut
// ---------------------------------------------------------------------------

/// Exclusive random access to one component type.
///
/// Writes stamp the column with the world version current when the lookup
/// was created.
pub struct ComponentLookupMut<'w, T: Component> {
    world: &'w World,
    id: ComponentTypeId,
    version: u32,
    _guard: AccessGuard<'w>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> ComponentLookupMut<'_, T> {
    pub fn get(&self, entity: EntityId) -> Result<&T, EcsError> {
        let (chunk, column, slot) = self.world.locate_value(entity, self.id)?;
        // SAFETY: the write token is held, and mutable views need `&mut self`.
        Ok(&unsafe { chunk.column_slice::<T>(column) }[slot])
    }

    pub fn get_mut(&mut self, entity: EntityId) -> Result<&mut T, EcsError> {
        let (chunk, column, slot) = self.world.locate_value(entity, self.id)?;
        chunk.set_version(column, self.version);
        // SAFETY: the write token is held and the view mutably borrows `self`.
        Ok(&mut unsafe { chunk.column_slice_mut::<T>(column) }[slot])
    }

    pub fn set(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        *self.get_mut(entity)? = value;
        Ok(())
    }

    pub fn has(&self, entity: EntityId) -> bool {
        self.world.locate_value(entity, self.id).is_ok()
    }
}

impl<T: Component> fmt::Debug for ComponentLookupMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentLookupMut")
            .field("component", &self.world.registry.name_of(self.id))
            .field("version", &self.version)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
