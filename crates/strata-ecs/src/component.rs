//! Component type registration and metadata.
//!
//! Every component type stored in the world must be registered at runtime in
//! the [`TypeRegistry`]. Registration produces a [`ComponentTypeId`] that is
//! the key for archetype interning, column lookups, and query matching.
//!
//! Two kinds of component exist:
//!
//! - **Per-entity** components are plain-old-data ([`bytemuck::Pod`]) and are
//!   stored once per record, contiguously inside each chunk.
//! - **Shared** components are arbitrary hashable values stored once per
//!   distinct value and referenced by every chunk whose records carry it.

use std::any::{Any, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::chunk::CHUNK_ALIGN;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Component bounds
// ---------------------------------------------------------------------------

/// A per-entity component: fixed-size bytes that can live in a chunk column.
pub trait Component: bytemuck::Pod + Send + Sync + 'static {}

impl<T> Component for T where T: bytemuck::Pod + Send + Sync + 'static {}

/// A shared component: one value per chunk, compared by equality.
pub trait SharedComponent: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> SharedComponent for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Type-erased view of a shared component value.
///
/// Lets the shared store intern values of heterogeneous types while still
/// comparing and hashing them by value.
pub trait SharedValue: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn SharedValue) -> bool;
    /// In-process interning key. Not stable across builds.
    fn dyn_hash(&self) -> u64;
    /// Feed the value's `Hash` output into `hasher` with fixed-width
    /// little-endian integers, so the bytes depend only on the value.
    fn stable_hash(&self, hasher: &mut blake3::Hasher);
    fn clone_boxed(&self) -> Box<dyn SharedValue>;
}

impl<T: SharedComponent> SharedValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn SharedValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn dyn_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        TypeId::of::<T>().hash(&mut hasher);
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn stable_hash(&self, hasher: &mut blake3::Hasher) {
        self.hash(&mut StableHasher(hasher));
    }

    fn clone_boxed(&self) -> Box<dyn SharedValue> {
        Box::new(self.clone())
    }
}

/// [`Hasher`] adapter writing into a blake3 state.
///
/// `usize` is widened to `u64` so 32- and 64-bit targets agree.
struct StableHasher<'a>(&'a mut blake3::Hasher);

impl Hasher for StableHasher<'_> {
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn write_u16(&mut self, i: u16) {
        self.write(&i.to_le_bytes());
    }

    fn write_u32(&mut self, i: u32) {
        self.write(&i.to_le_bytes());
    }

    fn write_u64(&mut self, i: u64) {
        self.write(&i.to_le_bytes());
    }

    fn write_u128(&mut self, i: u128) {
        self.write(&i.to_le_bytes());
    }

    fn write_usize(&mut self, i: usize) {
        self.write_u64(i as u64);
    }

    fn write_i16(&mut self, i: i16) {
        self.write_u16(i as u16);
    }

    fn write_i32(&mut self, i: i32) {
        self.write_u32(i as u32);
    }

    fn write_i64(&mut self, i: i64) {
        self.write_u64(i as u64);
    }

    fn write_isize(&mut self, i: isize) {
        self.write_u64(i as i64 as u64);
    }

    fn finish(&self) -> u64 {
        let digest = self.0.clone().finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
///
/// Ids are dense and assigned in registration order, so their numeric order
/// is the canonical sort order of archetype type sets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// Dense index of this type, usable for per-type tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentKind / ComponentInfo
// ---------------------------------------------------------------------------

/// Storage category of a component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    PerEntity,
    Shared,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::PerEntity => f.write_str("per-entity"),
            ComponentKind::Shared => f.write_str("shared"),
        }
    }
}

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Human-readable name (supplied by the caller).
    pub name: String,
    /// `std::mem::size_of::<T>()`; zero for tags and for shared types.
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    pub kind: ComponentKind,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their metadata.
///
/// A type can only be registered once; subsequent registrations of the same
/// Rust `TypeId` return the existing [`ComponentTypeId`].
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by ComponentTypeId.0.
    infos: Vec<ComponentInfo>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-entity component type under the given `name`.
    ///
    /// # Panics
    ///
    /// Panics if `T` needs stricter alignment than a chunk guarantees, if `T`
    /// is already registered as a shared component, or if `name` is taken by
    /// a different type.
    pub fn register<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        let align = std::mem::align_of::<T>();
        assert!(
            align <= CHUNK_ALIGN,
            "component '{name}' requires {align}-byte alignment; chunks guarantee {CHUNK_ALIGN}"
        );
        self.insert::<T>(name, std::mem::size_of::<T>(), align, ComponentKind::PerEntity)
    }

    /// Register a shared component type under the given `name`.
    ///
    /// Shared types occupy no column bytes; chunks reference their values.
    pub fn register_shared<T: SharedComponent>(&mut self, name: &str) -> ComponentTypeId {
        self.insert::<T>(name, 0, 1, ComponentKind::Shared)
    }

    fn insert<T: 'static>(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        kind: ComponentKind,
    ) -> ComponentTypeId {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            let info = &self.infos[existing.index()];
            assert_eq!(
                info.kind, kind,
                "component '{}' is already registered as {}",
                info.name, info.kind
            );
            return existing;
        }
        if self.by_name.contains_key(name) {
            panic!("component name '{name}' is already registered for a different type");
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            size,
            align,
            kind,
            type_id: rust_type_id,
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Look up a component type by its Rust `TypeId`.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Like [`lookup`](Self::lookup), but reports an unregistered type as an error.
    pub fn require<T: 'static>(&self) -> Result<ComponentTypeId, EcsError> {
        self.lookup::<T>().ok_or_else(|| EcsError::UnknownComponent {
            name: std::any::type_name::<T>().to_owned(),
        })
    }

    /// Look up a component type by its registered string name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component type ID.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// Registered name of `id`, or a placeholder for foreign ids.
    pub fn name_of(&self, id: ComponentTypeId) -> String {
        self.get_info(id)
            .map(|info| info.name.clone())
            .unwrap_or_else(|| format!("{id:?}"))
    }

    /// Storage kind of `id`; unknown ids are an error.
    pub fn kind_of(&self, id: ComponentTypeId) -> Result<ComponentKind, EcsError> {
        self.get_info(id)
            .map(|info| info.kind)
            .ok_or_else(|| EcsError::UnknownComponent {
                name: format!("{id:?}"),
            })
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Frozen;

    #[repr(C, align(32))]
    #[derive(Debug, Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Wide([u8; 32]);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Material(String);

    #[test]
    fn register_and_lookup() {
        let mut reg = TypeRegistry::new();
        let id = reg.register::<Pos>("position");
        assert_eq!(reg.lookup::<Pos>(), Some(id));
        assert_eq!(reg.lookup_by_name("position"), Some(id));
    }

    #[test]
    fn same_type_same_id() {
        let mut reg = TypeRegistry::new();
        let id1 = reg.register::<Pos>("position");
        let id2 = reg.register::<Pos>("position_again");
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn ids_follow_registration_order() {
        let mut reg = TypeRegistry::new();
        let p = reg.register::<Pos>("position");
        let v = reg.register::<Vel>("velocity");
        assert!(p < v);
        assert_eq!(v.index(), 1);
    }

    #[test]
    fn info_correctness() {
        let mut reg = TypeRegistry::new();
        let id = reg.register::<Pos>("position");
        let info = reg.get_info(id).unwrap();
        assert_eq!(info.name, "position");
        assert_eq!(info.size, std::mem::size_of::<Pos>());
        assert_eq!(info.align, std::mem::align_of::<Pos>());
        assert_eq!(info.kind, ComponentKind::PerEntity);
        assert_eq!(info.type_id, TypeId::of::<Pos>());
    }

    #[test]
    fn tag_components_have_zero_size() {
        let mut reg = TypeRegistry::new();
        let id = reg.register::<Frozen>("frozen");
        assert_eq!(reg.get_info(id).unwrap().size, 0);
    }

    #[test]
    fn shared_registration() {
        let mut reg = TypeRegistry::new();
        let id = reg.register_shared::<Material>("material");
        assert_eq!(reg.kind_of(id).unwrap(), ComponentKind::Shared);
        assert_eq!(reg.get_info(id).unwrap().size, 0);
    }

    #[test]
    #[should_panic(expected = "alignment")]
    fn over_aligned_component_panics() {
        let mut reg = TypeRegistry::new();
        reg.register::<Wide>("wide");
    }

    #[test]
    #[should_panic(expected = "already registered for a different type")]
    fn duplicate_name_panics() {
        let mut reg = TypeRegistry::new();
        reg.register::<Pos>("thing");
        reg.register::<Vel>("thing");
    }

    #[test]
    fn require_unknown_is_error() {
        let reg = TypeRegistry::new();
        assert!(matches!(
            reg.require::<Pos>(),
            Err(EcsError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn shared_values_compare_by_value() {
        let a: Box<dyn SharedValue> = Box::new(Material("stone".into()));
        let b: Box<dyn SharedValue> = Box::new(Material("stone".into()));
        let c: Box<dyn SharedValue> = Box::new(Material("wood".into()));
        assert!(a.dyn_eq(b.as_ref()));
        assert_eq!(a.dyn_hash(), b.dyn_hash());
        assert!(!a.dyn_eq(c.as_ref()));
        assert!(!a.dyn_eq(&7u32));
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Layer(u32, usize);

    #[test]
    fn stable_hash_uses_fixed_width_little_endian() {
        let mut hashed = blake3::Hasher::new();
        Layer(7, 9).stable_hash(&mut hashed);

        let mut expected = blake3::Hasher::new();
        expected.update(&7u32.to_le_bytes());
        expected.update(&9u64.to_le_bytes());
        assert_eq!(hashed.finalize(), expected.finalize());

        let mut other = blake3::Hasher::new();
        Layer(7, 10).stable_hash(&mut other);
        assert_ne!(other.finalize(), expected.finalize());
    }
}
