//! Query descriptions, cached matching-archetype lists, and chunk filters.
//!
//! A [`QueryDesc`] names component types in four roles: read, write (both
//! "All"), Any and None. Compiling it normalizes the description and looks
//! up a cached [`MatchingArchetypeList`]; a miss scans every archetype once.
//! Afterwards each newly created archetype is appended to every list it
//! matches, so lists are never rebuilt.
//!
//! Each compiled [`QueryId`] is an instance over a (possibly shared) list
//! with its own [`ChunkFilter`].

use std::collections::HashMap;
use std::fmt;

use crate::access::AccessMode;
use crate::archetype::{Archetype, ArchetypeId};
use crate::chunk::{did_change, Chunk};
use crate::component::{ComponentKind, ComponentTypeId, SharedComponent, SharedValue, TypeRegistry};
use crate::shared::{SharedIndex, SharedStore};
use crate::world::World;
use crate::EcsError;

/// Maximum number of types constrained by one filter.
pub const MAX_FILTER_TYPES: usize = 2;

// ---------------------------------------------------------------------------
// QueryId / QueryDesc
// ---------------------------------------------------------------------------

/// Handle of a compiled query instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub(crate) u32);

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({})", self.0)
    }
}

/// Unnormalized query description, built by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDesc {
    reads: Vec<ComponentTypeId>,
    writes: Vec<ComponentTypeId>,
    any: Vec<ComponentTypeId>,
    none: Vec<ComponentTypeId>,
}

impl QueryDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `id` with read access.
    pub fn read(mut self, id: ComponentTypeId) -> Self {
        self.reads.push(id);
        self
    }

    /// Require `id` with write access.
    pub fn write(mut self, id: ComponentTypeId) -> Self {
        self.writes.push(id);
        self
    }

    /// Require at least one of the `any` types.
    pub fn any(mut self, id: ComponentTypeId) -> Self {
        self.any.push(id);
        self
    }

    /// Exclude archetypes containing `id`.
    pub fn none(mut self, id: ComponentTypeId) -> Self {
        self.none.push(id);
        self
    }

    pub fn normalize(&self, registry: &TypeRegistry) -> Result<NormalizedQuery, EcsError> {
        for &id in self.reads.iter().chain(&self.writes).chain(&self.any).chain(&self.none) {
            registry.kind_of(id)?;
        }

        let mut all: Vec<(ComponentTypeId, AccessMode)> = Vec::new();
        for &id in &self.writes {
            all.push((id, AccessMode::Write));
        }
        for &id in &self.reads {
            if !self.writes.contains(&id) {
                all.push((id, AccessMode::Read));
            }
        }
        all.sort_unstable_by_key(|&(id, _)| id);
        all.dedup_by_key(|&mut (id, _)| id);

        let mut any = self.any.clone();
        any.sort_unstable();
        any.dedup();
        any.retain(|id| all.binary_search_by_key(id, |&(a, _)| a).is_err());

        let mut none = self.none.clone();
        none.sort_unstable();
        none.dedup();

        if let Some(&(id, _)) = all.iter().find(|(id, _)| none.binary_search(id).is_ok()) {
            return Err(EcsError::ContradictoryQuery {
                component: registry.name_of(id),
            });
        }

        Ok(NormalizedQuery { all, any, none })
    }
}

/// Canonical form of a query description; the cache key of matching lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedQuery {
    /// Sorted by id; a type requested both ways is kept as a write.
    all: Vec<(ComponentTypeId, AccessMode)>,
    any: Vec<ComponentTypeId>,
    none: Vec<ComponentTypeId>,
}

impl NormalizedQuery {
    pub fn matches(&self, archetype: &Archetype) -> bool {
        self.all.iter().all(|&(id, _)| archetype.has_component(id))
            && (self.any.is_empty() || self.any.iter().any(|&id| archetype.has_component(id)))
            && !self.none.iter().any(|&id| archetype.has_component(id))
    }

    pub fn all(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.all.iter().map(|&(id, _)| id)
    }

    pub fn any(&self) -> &[ComponentTypeId] {
        &self.any
    }

    /// Whether the All set is exactly `types`, in any order.
    pub fn requires_exactly(&self, types: &[ComponentTypeId]) -> bool {
        let mut types = types.to_vec();
        types.sort_unstable();
        types.dedup();
        types.len() == self.all.len() && self.all().zip(types).all(|(a, b)| a == b)
    }

    pub fn none(&self) -> &[ComponentTypeId] {
        &self.none
    }

    /// Types needing a read token: All types read-only, plus Any types.
    pub fn reads(&self) -> Vec<ComponentTypeId> {
        self.all
            .iter()
            .filter(|(_, mode)| *mode == AccessMode::Read)
            .map(|&(id, _)| id)
            .chain(self.any.iter().copied())
            .collect()
    }

    pub fn writes(&self) -> Vec<ComponentTypeId> {
        self.all
            .iter()
            .filter(|(_, mode)| *mode == AccessMode::Write)
            .map(|&(id, _)| id)
            .collect()
    }

    /// All types then Any types; the order of per-archetype type slots.
    fn named(&self) -> Vec<ComponentTypeId> {
        self.all().chain(self.any.iter().copied()).collect()
    }
}

// ---------------------------------------------------------------------------
// MatchingArchetypeList
// ---------------------------------------------------------------------------

/// Where a query-named type lives inside one archetype's chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSlot {
    /// Per-entity column index.
    Column(usize),
    /// Position in the chunk's shared index list.
    Shared(usize),
}

/// One matching archetype and the slot of every type the query names.
#[derive(Debug, Clone)]
pub struct MatchingArchetype {
    archetype: ArchetypeId,
    /// Parallel to the list's named types; `None` for absent Any types.
    slots: Vec<Option<TypeSlot>>,
}

impl MatchingArchetype {
    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    pub fn slot(&self, position: usize) -> Option<TypeSlot> {
        self.slots.get(position).copied().flatten()
    }
}

/// Archetypes matching one normalized query, in creation order.
#[derive(Debug)]
pub struct MatchingArchetypeList {
    query: NormalizedQuery,
    named: Vec<ComponentTypeId>,
    entries: Vec<MatchingArchetype>,
}

impl MatchingArchetypeList {
    fn new(query: NormalizedQuery) -> Self {
        let named = query.named();
        Self {
            query,
            named,
            entries: Vec::new(),
        }
    }

    /// Append `archetype` if it matches. Returns whether it was appended.
    fn consider(&mut self, archetype: &Archetype) -> bool {
        if !self.query.matches(archetype) {
            return false;
        }
        let slots = self
            .named
            .iter()
            .map(|&id| {
                archetype
                    .column_of(id)
                    .map(TypeSlot::Column)
                    .or_else(|| archetype.shared_slot_of(id).map(TypeSlot::Shared))
            })
            .collect();
        self.entries.push(MatchingArchetype {
            archetype: archetype.id(),
            slots,
        });
        true
    }

    pub fn query(&self) -> &NormalizedQuery {
        &self.query
    }

    pub fn entries(&self) -> &[MatchingArchetype] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Slot position of a type named by the query.
    pub fn position_of(&self, id: ComponentTypeId) -> Option<usize> {
        self.named.iter().position(|&named| named == id)
    }

    /// Validate `id` as a filter target: an All type of the given kind.
    fn filter_position(
        &self,
        registry: &TypeRegistry,
        id: ComponentTypeId,
        kind: ComponentKind,
    ) -> Result<usize, EcsError> {
        let actual = registry.kind_of(id)?;
        if actual != kind {
            return Err(EcsError::InvalidFilter {
                reason: format!(
                    "'{}' is a {actual} component, filter needs {kind}",
                    registry.name_of(id)
                ),
            });
        }
        match self.query.all().position(|all| all == id) {
            Some(position) => Ok(position),
            None => Err(EcsError::InvalidFilter {
                reason: format!("'{}' is not required by the query", registry.name_of(id)),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ChunkFilter
// ---------------------------------------------------------------------------

/// "The chunk's value of `component` is `index`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedConstraint {
    pub component: ComponentTypeId,
    pub index: SharedIndex,
    position: usize,
}

/// "Each of `components` was written after `required_version`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeConstraint {
    pub components: Vec<ComponentTypeId>,
    pub required_version: u32,
    positions: Vec<usize>,
}

/// Per-chunk predicate attached to a query instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChunkFilter {
    #[default]
    None,
    Shared(Vec<SharedConstraint>),
    Changed(ChangeConstraint),
}

impl ChunkFilter {
    pub fn is_none(&self) -> bool {
        matches!(self, ChunkFilter::None)
    }

    /// Whether `chunk` (belonging to `entry`'s archetype) passes the filter.
    pub fn matches(&self, entry: &MatchingArchetype, chunk: &Chunk) -> bool {
        match self {
            ChunkFilter::None => true,
            ChunkFilter::Shared(constraints) => constraints.iter().all(|c| {
                matches!(
                    entry.slot(c.position),
                    Some(TypeSlot::Shared(s)) if chunk.shared_indices()[s] == c.index
                )
            }),
            ChunkFilter::Changed(change) => change.positions.iter().all(|&p| {
                matches!(
                    entry.slot(p),
                    Some(TypeSlot::Column(col)) if did_change(chunk.version(col), change.required_version)
                )
            }),
        }
    }

    /// Drop the shared references this filter holds.
    fn release_refs(&self, shared: &mut SharedStore) {
        if let ChunkFilter::Shared(constraints) = self {
            for c in constraints {
                shared.release(c.index);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// QueryRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueryInstance {
    list: usize,
    filter: ChunkFilter,
}

/// Cached matching lists and the live query instances over them.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    lists: Vec<MatchingArchetypeList>,
    by_query: HashMap<NormalizedQuery, usize>,
    /// Indexed by `QueryId`; released ids stay `None`.
    instances: Vec<Option<QueryInstance>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `desc` into a new query instance with an empty filter.
    pub fn compile(
        &mut self,
        desc: &QueryDesc,
        registry: &TypeRegistry,
        archetypes: &[Archetype],
    ) -> Result<QueryId, EcsError> {
        let normalized = desc.normalize(registry)?;
        let list = match self.by_query.get(&normalized) {
            Some(&list) => list,
            None => {
                let mut list = MatchingArchetypeList::new(normalized.clone());
                for archetype in archetypes {
                    list.consider(archetype);
                }
                self.lists.push(list);
                self.by_query.insert(normalized, self.lists.len() - 1);
                self.lists.len() - 1
            }
        };

        let id = QueryId(self.instances.len() as u32);
        self.instances.push(Some(QueryInstance {
            list,
            filter: ChunkFilter::None,
        }));
        tracing::trace!(
            query = id.0,
            archetypes = self.lists[list].len(),
            "query compiled"
        );
        Ok(id)
    }

    /// Append a newly created archetype to every list it matches.
    pub fn on_archetype_created(&mut self, archetype: &Archetype) {
        for list in &mut self.lists {
            list.consider(archetype);
        }
    }

    fn instance(&self, query: QueryId) -> Result<&QueryInstance, EcsError> {
        self.instances
            .get(query.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(EcsError::UnknownQuery { query })
    }

    pub fn list(&self, query: QueryId) -> Result<&MatchingArchetypeList, EcsError> {
        let instance = self.instance(query)?;
        Ok(&self.lists[instance.list])
    }

    pub fn filter(&self, query: QueryId) -> Result<&ChunkFilter, EcsError> {
        Ok(&self.instance(query)?.filter)
    }

    /// Install `filter`, returning the one it replaces.
    fn replace_filter(&mut self, query: QueryId, filter: ChunkFilter) -> Result<ChunkFilter, EcsError> {
        let instance = self
            .instances
            .get_mut(query.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(EcsError::UnknownQuery { query })?;
        Ok(std::mem::replace(&mut instance.filter, filter))
    }

    /// Retire `query`, returning its last filter.
    fn release(&mut self, query: QueryId) -> Result<ChunkFilter, EcsError> {
        let slot = self
            .instances
            .get_mut(query.0 as usize)
            .ok_or(EcsError::UnknownQuery { query })?;
        slot.take()
            .map(|instance| instance.filter)
            .ok_or(EcsError::UnknownQuery { query })
    }

    /// Live query instances.
    pub fn len(&self) -> usize {
        self.instances.iter().filter(|i| i.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct cached matching lists.
    pub fn cached_list_count(&self) -> usize {
        self.lists.len()
    }
}

// ---------------------------------------------------------------------------
// QueryBuilder
// ---------------------------------------------------------------------------

/// Typed builder over [`QueryDesc`], created by [`World::query`].
///
/// The first unregistered type is reported by [`compile`](Self::compile).
pub struct QueryBuilder<'w> {
    world: &'w mut World,
    desc: QueryDesc,
    error: Option<EcsError>,
}

impl QueryBuilder<'_> {
    fn with<T: 'static>(mut self, add: fn(QueryDesc, ComponentTypeId) -> QueryDesc) -> Self {
        match self.world.registry.require::<T>() {
            Ok(id) => self.desc = add(self.desc, id),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
        }
        self
    }

    pub fn read<T: 'static>(self) -> Self {
        self.with::<T>(QueryDesc::read)
    }

    pub fn write<T: 'static>(self) -> Self {
        self.with::<T>(QueryDesc::write)
    }

    pub fn any<T: 'static>(self) -> Self {
        self.with::<T>(QueryDesc::any)
    }

    pub fn none<T: 'static>(self) -> Self {
        self.with::<T>(QueryDesc::none)
    }

    pub fn desc(&self) -> &QueryDesc {
        &self.desc
    }

    pub fn compile(self) -> Result<QueryId, EcsError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.world.compile_query(&self.desc)
    }
}

// ---------------------------------------------------------------------------
// World query API
// ---------------------------------------------------------------------------

impl World {
    /// Start a typed query description.
    pub fn query(&mut self) -> QueryBuilder<'_> {
        QueryBuilder {
            world: self,
            desc: QueryDesc::new(),
            error: None,
        }
    }

    pub fn compile_query(&mut self, desc: &QueryDesc) -> Result<QueryId, EcsError> {
        self.queries
            .compile(desc, &self.registry, self.archetypes.archetypes())
    }

    /// Archetypes matching `query`, in creation order.
    pub fn matching_archetypes(&self, query: QueryId) -> Result<Vec<ArchetypeId>, EcsError> {
        Ok(self
            .queries
            .list(query)?
            .entries()
            .iter()
            .map(MatchingArchetype::archetype)
            .collect())
    }

    pub fn query_filter(&self, query: QueryId) -> Result<&ChunkFilter, EcsError> {
        self.queries.filter(query)
    }

    /// Only visit chunks whose `T` value equals `value`.
    pub fn set_shared_filter<T: SharedComponent>(&mut self, query: QueryId, value: T) -> Result<(), EcsError> {
        let id = self.registry.require::<T>()?;
        let value: Box<dyn SharedValue> = Box::new(value);
        self.install_shared_filter(query, vec![(id, value)])
    }

    /// Only visit chunks whose `A` and `B` values equal `a` and `b`.
    pub fn set_shared_filter2<A: SharedComponent, B: SharedComponent>(
        &mut self,
        query: QueryId,
        a: A,
        b: B,
    ) -> Result<(), EcsError> {
        let id_a = self.registry.require::<A>()?;
        let id_b = self.registry.require::<B>()?;
        let a: Box<dyn SharedValue> = Box::new(a);
        let b: Box<dyn SharedValue> = Box::new(b);
        self.install_shared_filter(query, vec![(id_a, a), (id_b, b)])
    }

    fn install_shared_filter(
        &mut self,
        query: QueryId,
        values: Vec<(ComponentTypeId, Box<dyn SharedValue>)>,
    ) -> Result<(), EcsError> {
        if values.len() > MAX_FILTER_TYPES {
            return Err(EcsError::InvalidFilter {
                reason: format!("at most {MAX_FILTER_TYPES} shared constraints"),
            });
        }
        let list = self.queries.list(query)?;
        let mut positions = Vec::with_capacity(values.len());
        for (id, _) in &values {
            let position = list.filter_position(&self.registry, *id, ComponentKind::Shared)?;
            if positions.contains(&position) {
                return Err(EcsError::InvalidFilter {
                    reason: format!("'{}' constrained twice", self.registry.name_of(*id)),
                });
            }
            positions.push(position);
        }

        let constraints = values
            .into_iter()
            .zip(positions)
            .map(|((component, value), position)| SharedConstraint {
                component,
                index: self.shared.intern(component, value),
                position,
            })
            .collect();
        let previous = self.queries.replace_filter(query, ChunkFilter::Shared(constraints))?;
        previous.release_refs(&mut self.shared);
        Ok(())
    }

    /// Only visit chunks whose `components` columns changed after `required_version`.
    pub fn set_changed_filter(
        &mut self,
        query: QueryId,
        components: &[ComponentTypeId],
        required_version: u32,
    ) -> Result<(), EcsError> {
        if components.is_empty() || components.len() > MAX_FILTER_TYPES {
            return Err(EcsError::InvalidFilter {
                reason: format!("change filter needs 1 to {MAX_FILTER_TYPES} components"),
            });
        }
        let list = self.queries.list(query)?;
        let mut positions = Vec::with_capacity(components.len());
        for &id in components {
            let position = list.filter_position(&self.registry, id, ComponentKind::PerEntity)?;
            if !positions.contains(&position) {
                positions.push(position);
            }
        }

        let filter = ChunkFilter::Changed(ChangeConstraint {
            components: components.to_vec(),
            required_version,
            positions,
        });
        let previous = self.queries.replace_filter(query, filter)?;
        previous.release_refs(&mut self.shared);
        Ok(())
    }

    /// Remove the query's filter, releasing any shared references it held.
    pub fn reset_filter(&mut self, query: QueryId) -> Result<(), EcsError> {
        let previous = self.queries.replace_filter(query, ChunkFilter::None)?;
        previous.release_refs(&mut self.shared);
        Ok(())
    }

    /// Retire `query`. Its id becomes invalid; the cached list stays.
    pub fn release_query(&mut self, query: QueryId) -> Result<(), EcsError> {
        match self.queries.release(query) {
            Ok(previous) => {
                previous.release_refs(&mut self.shared);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(query = query.0, "release of an unknown or retired query");
                Err(e)
            }
        }
    }

    /// `true` when no matching archetype holds any record, ignoring the filter.
    pub fn is_empty_ignore_filter(&self, query: QueryId) -> Result<bool, EcsError> {
        for entry in self.queries.list(query)?.entries() {
            if !self.archetypes.require(entry.archetype())?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sum of the order versions of the query's All types.
    pub fn combined_order_version(&self, query: QueryId) -> Result<u32, EcsError> {
        Ok(self
            .queries
            .list(query)?
            .query()
            .all()
            .fold(0u32, |acc, id| acc.wrapping_add(self.order_version(id))))
    }

    /// Whether `query` requires exactly the component types in `types`.
    ///
    /// Any and None types are not part of the comparison.
    pub fn compare_components(&self, query: QueryId, types: &[ComponentTypeId]) -> Result<bool, EcsError> {
        Ok(self.queries.list(query)?.query().requires_exactly(types))
    }

    /// Non-empty chunks of `query` that pass its filter, in iteration order.
    pub(crate) fn filtered_chunks(
        &self,
        query: QueryId,
    ) -> Result<Vec<(&MatchingArchetype, &Chunk)>, EcsError> {
        let list = self.queries.list(query)?;
        let filter = self.queries.filter(query)?;
        let mut out = Vec::new();
        for entry in list.entries() {
            let archetype = self.archetypes.require(entry.archetype())?;
            for &chunk_id in archetype.chunks() {
                let chunk = self.archetypes.live_chunk(chunk_id)?;
                if chunk.count() > 0 && filter.matches(entry, chunk) {
                    out.push((entry, chunk));
                }
            }
        }
        Ok(out)
    }

    /// Records visited by `query`, honoring its filter.
    pub fn calculate_length(&self, query: QueryId) -> Result<usize, EcsError> {
        Ok(self
            .filtered_chunks(query)?
            .iter()
            .map(|(_, chunk)| chunk.count())
            .sum())
    }

    /// Chunks visited by `query`, honoring its filter.
    pub fn calculate_chunk_count(&self, query: QueryId) -> Result<usize, EcsError> {
        Ok(self.filtered_chunks(query)?.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
