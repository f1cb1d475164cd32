//! Per-component read/write access tokens.
//!
//! Anything that reads or writes column memory through a shared `&World`
//! (chunk iterators, parallel chunk jobs, component lookups) first acquires
//! tokens for the component types it touches. Each type maps to one
//! `AtomicUsize`:
//!
//! | State | Meaning |
//! |------:|---------|
//! | `0` | Free |
//! | `1` | Held by one writer |
//! | `>= 2` | Held by `state - 1` readers |
//!
//! Acquisition is fail-fast: a conflicting request returns
//! [`EcsError::ConcurrencyViolation`] immediately instead of waiting.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::component::{ComponentTypeId, TypeRegistry};
use crate::EcsError;

const FREE: usize = 0;
const WRITE_LOCKED: usize = 1;

/// Kind of access requested on a component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("read"),
            AccessMode::Write => f.write_str("write"),
        }
    }
}

// ---------------------------------------------------------------------------
// AccessTracker
// ---------------------------------------------------------------------------

/// Token state for every registered component type.
#[derive(Debug, Default)]
pub struct AccessTracker {
    states: Vec<AtomicUsize>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow to cover `len` component types. Called on registration.
    pub(crate) fn ensure_len(&mut self, len: usize) {
        while self.states.len() < len {
            self.states.push(AtomicUsize::new(FREE));
        }
    }

    /// Take a read token, or report the conflicting holder.
    pub fn try_acquire_read(&self, id: ComponentTypeId) -> Result<(), AccessMode> {
        let state = &self.states[id.index()];
        let mut current = state.load(Ordering::Acquire);
        loop {
            if current == WRITE_LOCKED {
                return Err(AccessMode::Write);
            }
            let next = if current == FREE { 2 } else { current + 1 };
            match state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                // Lost a race with another reader (or a spurious failure).
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release_read(&self, id: ComponentTypeId) {
        let state = &self.states[id.index()];
        let mut current = state.load(Ordering::Acquire);
        loop {
            debug_assert!(current >= 2, "read release without a read token");
            let next = if current == 2 { FREE } else { current - 1 };
            match state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Take the write token, or report the conflicting holder.
    pub fn try_acquire_write(&self, id: ComponentTypeId) -> Result<(), AccessMode> {
        match self.states[id.index()].compare_exchange(
            FREE,
            WRITE_LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(WRITE_LOCKED) => Err(AccessMode::Write),
            Err(_) => Err(AccessMode::Read),
        }
    }

    pub fn release_write(&self, id: ComponentTypeId) {
        let previous = self.states[id.index()].swap(FREE, Ordering::AcqRel);
        debug_assert_eq!(previous, WRITE_LOCKED, "write release without the write token");
    }

    /// Whether no token of any kind is held on `id`.
    pub fn is_free(&self, id: ComponentTypeId) -> bool {
        self.states[id.index()].load(Ordering::Acquire) == FREE
    }

    /// Number of readers currently holding `id`.
    pub fn readers(&self, id: ComponentTypeId) -> usize {
        match self.states[id.index()].load(Ordering::Acquire) {
            FREE | WRITE_LOCKED => 0,
            n => n - 1,
        }
    }
}

// ---------------------------------------------------------------------------
// AccessGuard
// ---------------------------------------------------------------------------

/// RAII set of held tokens. Dropping the guard releases all of them.
pub struct AccessGuard<'a> {
    tracker: &'a AccessTracker,
    reads: Vec<ComponentTypeId>,
    writes: Vec<ComponentTypeId>,
}

impl<'a> AccessGuard<'a> {
    /// Acquire write tokens on `writes` and read tokens on `reads`.
    ///
    /// A type listed in both is only taken for writing. On conflict every
    /// token taken so far is released before the error is returned.
    pub fn acquire(
        tracker: &'a AccessTracker,
        registry: &TypeRegistry,
        reads: &[ComponentTypeId],
        writes: &[ComponentTypeId],
    ) -> Result<Self, EcsError> {
        let mut writes = writes.to_vec();
        writes.sort_unstable();
        writes.dedup();
        let mut reads: Vec<ComponentTypeId> = reads
            .iter()
            .copied()
            .filter(|id| writes.binary_search(id).is_err())
            .collect();
        reads.sort_unstable();
        reads.dedup();

        let mut guard = AccessGuard {
            tracker,
            reads: Vec::with_capacity(reads.len()),
            writes: Vec::with_capacity(writes.len()),
        };
        for id in writes {
            tracker
                .try_acquire_write(id)
                .map_err(|held| violation(registry, id, AccessMode::Write, held))?;
            guard.writes.push(id);
        }
        for id in reads {
            tracker
                .try_acquire_read(id)
                .map_err(|held| violation(registry, id, AccessMode::Read, held))?;
            guard.reads.push(id);
        }
        Ok(guard)
    }

    pub fn can_read(&self, id: ComponentTypeId) -> bool {
        self.reads.binary_search(&id).is_ok() || self.can_write(id)
    }

    pub fn can_write(&self, id: ComponentTypeId) -> bool {
        self.writes.binary_search(&id).is_ok()
    }

    /// Check that `mode` access to `id` is held, naming the component on failure.
    pub(crate) fn check(
        &self,
        registry: &TypeRegistry,
        id: ComponentTypeId,
        mode: AccessMode,
    ) -> Result<(), EcsError> {
        let held = match mode {
            AccessMode::Read => self.can_read(id),
            AccessMode::Write => self.can_write(id),
        };
        if held {
            Ok(())
        } else {
            Err(EcsError::AccessNotDeclared {
                component: registry.name_of(id),
                requested: mode,
            })
        }
    }
}

fn violation(
    registry: &TypeRegistry,
    id: ComponentTypeId,
    requested: AccessMode,
    held: AccessMode,
) -> EcsError {
    EcsError::ConcurrencyViolation {
        component: registry.name_of(id),
        requested,
        held,
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        for &id in &self.reads {
            self.tracker.release_read(id);
        }
        for &id in &self.writes {
            self.tracker.release_write(id);
        }
    }
}

impl fmt::Debug for AccessGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGuard")
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
