//! The [`World`] is the top-level container of the store. It owns the type
//! registry, the entity table, every archetype and chunk, the shared value
//! store, the query registry and the access tokens.
//!
//! Structural operations take `&mut World`, so they never overlap an
//! iterator or lookup (which hold `&World`).

use std::fmt;

use crate::access::AccessTracker;
use crate::archetype::{Archetype, ArchetypeId, ArchetypeManager};
use crate::chunk::Chunk;
use crate::component::{
    Component, ComponentKind, ComponentTypeId, SharedComponent, SharedValue, TypeRegistry,
};
use crate::config::StoreConfig;
use crate::entity::{EntityId, EntityLocation, EntityTable};
use crate::query::QueryRegistry;
use crate::shared::{SharedIndex, SharedStore};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum BundleValue {
    Data(Vec<u8>),
    Shared(Box<dyn SharedValue>),
}

/// A set of component values used to spawn an entity.
///
/// Each component type may appear at most once.
#[derive(Debug, Default)]
pub struct ComponentBundle {
    entries: Vec<(ComponentTypeId, BundleValue)>,
}

impl ComponentBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a per-entity component.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered as a per-entity component, or if a
    /// value of the same type is already in the bundle.
    pub fn add<T: Component>(&mut self, registry: &TypeRegistry, value: T) {
        let id = self.checked_id::<T>(registry, ComponentKind::PerEntity);
        self.entries
            .push((id, BundleValue::Data(bytemuck::bytes_of(&value).to_vec())));
    }

    /// Add a shared component value.
    ///
    /// # Panics
    ///
    /// As [`add`](Self::add), for shared components.
    pub fn add_shared<T: SharedComponent>(&mut self, registry: &TypeRegistry, value: T) {
        let id = self.checked_id::<T>(registry, ComponentKind::Shared);
        self.entries.push((id, BundleValue::Shared(Box::new(value))));
    }

    fn checked_id<T: 'static>(&self, registry: &TypeRegistry, kind: ComponentKind) -> ComponentTypeId {
        let id = registry
            .lookup::<T>()
            .expect("component type not registered -- register it on the world first");
        let actual = registry.kind_of(id).expect("id comes from this registry");
        assert_eq!(
            actual,
            kind,
            "component '{}' is registered as {actual}",
            registry.name_of(id)
        );
        if self.entries.iter().any(|(existing, _)| *existing == id) {
            panic!(
                "duplicate component type '{}' in ComponentBundle -- each component type can only be added once",
                registry.name_of(id)
            );
        }
        id
    }

    /// Component types in this bundle, in insertion order.
    pub fn type_ids(&self) -> Vec<ComponentTypeId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The top-level store.
pub struct World {
    config: StoreConfig,
    pub(crate) registry: TypeRegistry,
    pub(crate) entities: EntityTable,
    pub(crate) archetypes: ArchetypeManager,
    pub(crate) shared: SharedStore,
    pub(crate) queries: QueryRegistry,
    pub(crate) access: AccessTracker,
    /// Per component type, bumped when records of an archetype holding the
    /// type are added or removed.
    order_versions: Vec<u32>,
    version: u32,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.entities.len())
            .field("archetype_count", &self.archetypes.archetypes().len())
            .field("chunk_count", &self.archetypes.chunk_count())
            .field("version", &self.version)
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world with the default [`StoreConfig`].
    pub fn new() -> Self {
        Self::build(StoreConfig::default())
    }

    /// Create an empty world, rejecting an invalid configuration.
    pub fn with_config(config: StoreConfig) -> Result<Self, EcsError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: StoreConfig) -> Self {
        Self {
            archetypes: ArchetypeManager::new(config.chunk_bytes),
            config,
            registry: TypeRegistry::new(),
            entities: EntityTable::new(),
            shared: SharedStore::new(),
            queries: QueryRegistry::new(),
            access: AccessTracker::new(),
            order_versions: Vec::new(),
            version: 1,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read-only access to the type registry.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    // -- registration -------------------------------------------------------

    /// Register a per-entity component type.
    pub fn register_component<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        let id = self.registry.register::<T>(name);
        self.on_registered();
        id
    }

    /// Register a shared component type.
    pub fn register_shared_component<T: SharedComponent>(&mut self, name: &str) -> ComponentTypeId {
        let id = self.registry.register_shared::<T>(name);
        self.on_registered();
        id
    }

    fn on_registered(&mut self) {
        let len = self.registry.len();
        self.access.ensure_len(len);
        self.order_versions.resize(len, 0);
    }

    pub fn component_type_id<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.registry.lookup::<T>()
    }

    pub(crate) fn expect_kind(&self, id: ComponentTypeId, expected: ComponentKind) -> Result<(), EcsError> {
        let actual = self.registry.kind_of(id)?;
        if actual == expected {
            Ok(())
        } else {
            Err(EcsError::KindMismatch {
                component: self.registry.name_of(id),
                expected,
                actual,
            })
        }
    }

    // -- versions -----------------------------------------------------------

    /// Current world version; starts at 1.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Move to the next version, skipping 0 on wrap. Returns the new version.
    pub fn advance_version(&mut self) -> u32 {
        self.version = self.version.wrapping_add(1);
        if self.version == 0 {
            self.version = 1;
        }
        self.version
    }

    /// Order version of one component type.
    pub fn order_version(&self, id: ComponentTypeId) -> u32 {
        self.order_versions.get(id.index()).copied().unwrap_or(0)
    }

    fn bump_order_versions(&mut self, archetype: ArchetypeId) {
        if let Some(arch) = self.archetypes.archetype(archetype) {
            for id in arch.component_types() {
                let v = &mut self.order_versions[id.index()];
                *v = v.wrapping_add(1);
            }
        }
    }

    // -- archetypes and chunks ---------------------------------------------

    /// Archetype for `types`, interned on first use.
    pub fn archetype_for(&mut self, types: &[ComponentTypeId]) -> Result<ArchetypeId, EcsError> {
        let (id, created) = self.archetypes.get_or_create(types, &self.registry)?;
        if created {
            let arch = self
                .archetypes
                .archetype(id)
                .expect("archetype was just created");
            self.queries.on_archetype_created(arch);
        }
        Ok(id)
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.archetype(id)
    }

    /// All archetypes, in creation order.
    pub fn archetypes(&self) -> &[Archetype] {
        self.archetypes.archetypes()
    }

    pub fn chunk(&self, id: crate::chunk::ChunkId) -> Option<&Chunk> {
        self.archetypes.chunk(id)
    }

    pub fn chunk_count(&self) -> usize {
        self.archetypes.chunk_count()
    }

    pub fn pooled_chunk_count(&self) -> usize {
        self.archetypes.pooled_chunk_count()
    }

    /// Number of distinct live shared values.
    pub fn shared_value_count(&self) -> usize {
        self.shared.len()
    }

    // -- record placement ---------------------------------------------------

    /// Put `entity` into a chunk of `archetype` with `shared` values.
    ///
    /// The caller holds one reference on each of `shared`; it becomes the
    /// new chunk's reference, or is dropped if an existing chunk was used.
    fn place(&mut self, entity: EntityId, archetype: ArchetypeId, shared: Vec<SharedIndex>) -> EntityLocation {
        let (chunk, slot, created) = self.archetypes.allocate_record(archetype, &shared, entity);
        if !created {
            for idx in shared {
                self.shared.release(idx);
            }
        }
        self.bump_order_versions(archetype);
        let location = EntityLocation {
            archetype,
            chunk,
            slot,
        };
        self.entities.set_location(entity, location);
        location
    }

    /// Remove the record at `location`, fixing up the swapped-in entity.
    fn vacate(&mut self, location: EntityLocation) -> Result<(), EcsError> {
        let outcome = self.archetypes.free_record(location.chunk, location.slot)?;
        if let Some(moved) = outcome.moved {
            self.entities.set_slot(moved, location.slot);
        }
        if let Some(released) = outcome.released {
            for &idx in released.iter() {
                self.shared.release(idx);
            }
        }
        self.bump_order_versions(location.archetype);
        Ok(())
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawn a new entity from a [`ComponentBundle`].
    pub fn spawn_bundle(&mut self, bundle: ComponentBundle) -> Result<EntityId, EcsError> {
        let archetype = self.archetype_for(&bundle.type_ids())?;
        let arch = self.archetypes.require(archetype)?;

        let mut columns = Vec::new();
        let mut shared_values = Vec::new();
        for (id, value) in bundle.entries {
            match value {
                BundleValue::Data(bytes) => {
                    let column = arch.column_of(id).expect("bundle types form the archetype");
                    columns.push((column, bytes));
                }
                BundleValue::Shared(value) => shared_values.push((id, value)),
            }
        }
        // Canonical shared order is by id.
        shared_values.sort_by_key(|(id, _)| *id);
        let shared: Vec<SharedIndex> = shared_values
            .into_iter()
            .map(|(id, value)| self.shared.intern(id, value))
            .collect();

        let entity = self.entities.allocate();
        let location = self.place(entity, archetype, shared);
        let version = self.version;
        let chunk = self.archetypes.live_chunk_mut(location.chunk)?;
        for (column, bytes) in columns {
            chunk.write_value_bytes(column, location.slot, &bytes);
        }
        chunk.stamp_all(version);
        Ok(entity)
    }

    /// Spawn a new entity with a single per-entity component.
    pub fn spawn_with<T: Component>(&mut self, component: T) -> Result<EntityId, EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::PerEntity)?;
        let mut bundle = ComponentBundle::new();
        bundle.add(&self.registry, component);
        self.spawn_bundle(bundle)
    }

    /// Create an entity in `archetype` with every column zeroed.
    ///
    /// Archetypes with shared types need their values; use
    /// [`spawn_bundle`](Self::spawn_bundle) for those.
    pub fn create_entity(&mut self, archetype: ArchetypeId) -> Result<EntityId, EcsError> {
        let arch = self.archetypes.require(archetype)?;
        if let Some(&shared) = arch.shared_types().first() {
            return Err(EcsError::SharedValueRequired {
                component: self.registry.name_of(shared),
            });
        }

        let entity = self.entities.allocate();
        let location = self.place(entity, archetype, Vec::new());
        let version = self.version;
        let chunk = self.archetypes.live_chunk_mut(location.chunk)?;
        chunk.zero_record(location.slot);
        chunk.stamp_all(version);
        Ok(entity)
    }

    /// Destroy an entity, removing its record and recycling its id.
    pub fn destroy_entity(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let location = self.entities.free(entity)?;
        self.vacate(location)
    }

    pub fn exists(&self, entity: EntityId) -> bool {
        self.entities.contains(entity)
    }

    /// Total number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Chunk and slot currently holding `entity`.
    pub fn resolve(&self, entity: EntityId) -> Result<EntityLocation, EcsError> {
        self.entities.resolve(entity)
    }

    /// Whether `entity` carries component `T` (either kind).
    pub fn has_component<T: 'static>(&self, entity: EntityId) -> bool {
        let (Ok(location), Some(id)) = (self.resolve(entity), self.registry.lookup::<T>()) else {
            return false;
        };
        self.archetypes
            .archetype(location.archetype)
            .is_some_and(|arch| arch.has_component(id))
    }

    // -- component access ---------------------------------------------------

    fn missing(&self, entity: EntityId, id: ComponentTypeId) -> EcsError {
        EcsError::MissingComponent {
            entity,
            component: self.registry.name_of(id),
        }
    }

    /// Mutable access to one value. Stamps the column with the current version.
    pub fn get_component_mut<T: Component>(&mut self, entity: EntityId) -> Result<&mut T, EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::PerEntity)?;
        let location = self.resolve(entity)?;
        let column = self
            .archetypes
            .require(location.archetype)?
            .column_of(id)
            .ok_or_else(|| self.missing(entity, id))?;

        let version = self.version;
        let chunk = self.archetypes.live_chunk_mut(location.chunk)?;
        chunk.set_version(column, version);
        Ok(&mut chunk.column_exclusive::<T>(column)[location.slot])
    }

    /// Overwrite one value. Stamps the column with the current version.
    pub fn set_component<T: Component>(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        *self.get_component_mut::<T>(entity)? = value;
        Ok(())
    }

    /// Value of shared component `T` on `entity`.
    pub fn get_shared_component<T: SharedComponent>(&self, entity: EntityId) -> Result<T, EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::Shared)?;
        let location = self.resolve(entity)?;
        let slot = self
            .archetypes
            .require(location.archetype)?
            .shared_slot_of(id)
            .ok_or_else(|| self.missing(entity, id))?;
        let chunk = self.archetypes.live_chunk(location.chunk)?;
        self.shared
            .get_typed::<T>(chunk.shared_indices()[slot])
            .cloned()
            .ok_or_else(|| self.missing(entity, id))
    }

    // -- structural changes -------------------------------------------------

    /// Add a per-entity component, overwriting in place if already present.
    pub fn add_component<T: Component>(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::PerEntity)?;
        let location = self.resolve(entity)?;
        let arch = self.archetypes.require(location.archetype)?;
        if arch.has_component(id) {
            return self.set_component(entity, value);
        }

        let mut types = arch.component_types().to_vec();
        types.push(id);
        let added = (id, bytemuck::bytes_of(&value).to_vec());
        self.move_entity(entity, location, &types, Vec::new(), Some(added))
    }

    /// Add a shared component, or change its value if already present.
    pub fn add_shared_component<T: SharedComponent>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<(), EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::Shared)?;
        let location = self.resolve(entity)?;
        let arch = self.archetypes.require(location.archetype)?;
        if arch.has_component(id) {
            return self.set_shared_component(entity, value);
        }

        let mut types = arch.component_types().to_vec();
        types.push(id);
        let idx = self.shared.intern(id, Box::new(value));
        self.move_entity(entity, location, &types, vec![(id, idx)], None)
    }

    /// Change the value of a shared component the entity already carries.
    ///
    /// The entity moves to a chunk keyed by the new value.
    pub fn set_shared_component<T: SharedComponent>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<(), EcsError> {
        let id = self.registry.require::<T>()?;
        self.expect_kind(id, ComponentKind::Shared)?;
        let location = self.resolve(entity)?;
        let arch = self.archetypes.require(location.archetype)?;
        let slot = arch.shared_slot_of(id).ok_or_else(|| self.missing(entity, id))?;
        let types = arch.component_types().to_vec();

        let current = self
            .archetypes
            .live_chunk(location.chunk)?
            .shared_indices()[slot];
        let idx = self.shared.intern(id, Box::new(value));
        if idx == current {
            self.shared.release(idx);
            return Ok(());
        }
        self.move_entity(entity, location, &types, vec![(id, idx)], None)
    }

    /// Remove component `T` (either kind). No-op when absent.
    pub fn remove_component<T: 'static>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let id = self.registry.require::<T>()?;
        let location = self.resolve(entity)?;
        let arch = self.archetypes.require(location.archetype)?;
        if !arch.has_component(id) {
            return Ok(());
        }
        let types: Vec<ComponentTypeId> = arch
            .component_types()
            .iter()
            .copied()
            .filter(|&t| t != id)
            .collect();
        self.move_entity(entity, location, &types, Vec::new(), None)
    }

    /// Move `entity` from `from` into the archetype of `types`.
    ///
    /// `overrides` replace shared values (each carrying one reference owned
    /// by this call); other shared values and common columns are copied.
    fn move_entity(
        &mut self,
        entity: EntityId,
        from: EntityLocation,
        types: &[ComponentTypeId],
        overrides: Vec<(ComponentTypeId, SharedIndex)>,
        added: Option<(ComponentTypeId, Vec<u8>)>,
    ) -> Result<(), EcsError> {
        let target = match self.archetype_for(types) {
            Ok(target) => target,
            Err(e) => {
                for (_, idx) in overrides {
                    self.shared.release(idx);
                }
                return Err(e);
            }
        };

        let src = self.archetypes.require(from.archetype)?;
        let dst = self.archetypes.require(target)?;
        let old_shared = self
            .archetypes
            .live_chunk(from.chunk)?
            .shared_indices();

        let mut shared = Vec::with_capacity(dst.shared_types().len());
        for &id in dst.shared_types() {
            match overrides.iter().find(|(o, _)| *o == id) {
                Some(&(_, idx)) => shared.push(idx),
                None => {
                    let slot = src.shared_slot_of(id).expect("kept shared types exist in source");
                    shared.push(old_shared[slot]);
                }
            }
        }
        let copies: Vec<(usize, usize)> = dst
            .per_entity_types()
            .iter()
            .filter_map(|&id| Some((src.column_of(id)?, dst.column_of(id)?)))
            .collect();
        let added = added.map(|(id, bytes)| {
            (dst.column_of(id).expect("added type is in the target"), bytes)
        });
        for &idx in &shared {
            if !overrides.iter().any(|&(_, o)| o == idx) {
                self.shared.add_ref(idx);
            }
        }

        let to = self.place(entity, target, shared);
        for (src_col, dst_col) in copies {
            self.archetypes
                .copy_value((from.chunk, src_col, from.slot), (to.chunk, dst_col, to.slot));
        }
        let version = self.version;
        let chunk = self.archetypes.live_chunk_mut(to.chunk)?;
        if let Some((column, bytes)) = added {
            chunk.write_value_bytes(column, to.slot, &bytes);
        }
        chunk.stamp_all(version);

        self.vacate(from)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
