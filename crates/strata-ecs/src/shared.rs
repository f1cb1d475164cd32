//! Interned, reference-counted shared component values.
//!
//! Each distinct `(type, value)` pair is stored once and addressed by a
//! [`SharedIndex`]. Chunks hold one reference per shared value they carry,
//! shared filters hold one more. A value whose count drops to zero is freed
//! and its index recycled.

use std::collections::HashMap;
use std::fmt;

use crate::component::{ComponentTypeId, SharedValue};

/// Index of an interned shared value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedIndex(pub(crate) u32);

impl fmt::Debug for SharedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedIndex({})", self.0)
    }
}

#[derive(Debug)]
struct SharedEntry {
    component: ComponentTypeId,
    hash: u64,
    value: Box<dyn SharedValue>,
    refcount: u32,
}

/// Storage for every live shared value of a world.
#[derive(Debug, Default)]
pub struct SharedStore {
    entries: Vec<Option<SharedEntry>>,
    by_hash: HashMap<(ComponentTypeId, u64), Vec<SharedIndex>>,
    free: Vec<u32>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the index of an already interned value.
    pub fn find(&self, component: ComponentTypeId, value: &dyn SharedValue) -> Option<SharedIndex> {
        let candidates = self.by_hash.get(&(component, value.dyn_hash()))?;
        candidates.iter().copied().find(|idx| {
            self.entry(*idx)
                .is_some_and(|entry| entry.value.dyn_eq(value))
        })
    }

    /// Intern `value` and take one reference on it.
    pub fn intern(&mut self, component: ComponentTypeId, value: Box<dyn SharedValue>) -> SharedIndex {
        if let Some(idx) = self.find(component, value.as_ref()) {
            self.add_ref(idx);
            return idx;
        }

        let hash = value.dyn_hash();
        let entry = SharedEntry {
            component,
            hash,
            value,
            refcount: 1,
        };
        let idx = match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                SharedIndex(slot)
            }
            None => {
                self.entries.push(Some(entry));
                SharedIndex(self.entries.len() as u32 - 1)
            }
        };
        self.by_hash.entry((component, hash)).or_default().push(idx);
        idx
    }

    pub fn add_ref(&mut self, idx: SharedIndex) {
        if let Some(entry) = self.entry_mut(idx) {
            entry.refcount += 1;
        }
    }

    /// Drop one reference, freeing the value when none remain.
    pub fn release(&mut self, idx: SharedIndex) {
        let Some(entry) = self.entry_mut(idx) else {
            tracing::warn!(index = idx.0, "release of a freed shared value");
            return;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }

        let key = (entry.component, entry.hash);
        self.entries[idx.0 as usize] = None;
        self.free.push(idx.0);
        if let Some(bucket) = self.by_hash.get_mut(&key) {
            bucket.retain(|&other| other != idx);
            if bucket.is_empty() {
                self.by_hash.remove(&key);
            }
        }
    }

    pub fn get(&self, idx: SharedIndex) -> Option<&dyn SharedValue> {
        self.entry(idx).map(|entry| entry.value.as_ref())
    }

    /// Typed access; `None` when freed or of a different type.
    pub fn get_typed<T: 'static>(&self, idx: SharedIndex) -> Option<&T> {
        self.get(idx)?.as_any().downcast_ref::<T>()
    }

    pub fn component_of(&self, idx: SharedIndex) -> Option<ComponentTypeId> {
        self.entry(idx).map(|entry| entry.component)
    }

    pub fn refcount(&self, idx: SharedIndex) -> u32 {
        self.entry(idx).map_or(0, |entry| entry.refcount)
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, idx: SharedIndex) -> Option<&SharedEntry> {
        self.entries.get(idx.0 as usize)?.as_ref()
    }

    fn entry_mut(&mut self, idx: SharedIndex) -> Option<&mut SharedEntry> {
        self.entries.get_mut(idx.0 as usize)?.as_mut()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
