//! Fixed-order tick loop over the chunk store.
//!
//! The [`TickLoop`] drives the workload forward. Each tick:
//!
//! 1. All registered systems run in registration order, each receiving the
//!    [`World`] and the run's [`TickContext`].
//! 2. The world version advances, so the next tick's writes are
//!    distinguishable from this tick's.
//! 3. The tick counter advances.
//!
//! System order is fixed and all randomness comes from the context's seeded
//! `Pcg64`, so the same config always produces the same final state.

use std::time::{Duration, Instant};

use rand_pcg::Pcg64;
use strata_ecs::prelude::*;

// ---------------------------------------------------------------------------
// TickContext
// ---------------------------------------------------------------------------

/// Queries compiled once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SimQueries {
    /// Write `Position`, read `Velocity`, skip `Frozen`.
    pub movers: QueryId,
    /// Write `Health`, read `Team`.
    pub healers: QueryId,
    /// Read `Position`.
    pub positions: QueryId,
}

/// Mutable run state shared by the systems.
#[derive(Debug)]
pub struct TickContext {
    pub rng: Pcg64,
    pub queries: SimQueries,
    pub teams: u8,
    pub structural_churn: f64,
    pub parallel: bool,
    /// Live entities, in no particular order.
    pub live: Vec<EntityId>,
    /// World version at the end of the previous tick.
    pub last_version: u32,
    /// Chunks whose positions changed during the last tick.
    pub changed_chunks: usize,
    /// Tag toggles and recycles performed so far.
    pub structural_moves: u64,
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per system (in order of execution).
    pub system_times: Vec<(String, Duration)>,
    pub total_time: Duration,
}

// ---------------------------------------------------------------------------
// SystemFn
// ---------------------------------------------------------------------------

/// A system run once per tick.
pub type SystemFn = fn(&mut World, &mut TickContext) -> Result<(), EcsError>;

#[derive(Debug)]
struct RegisteredSystem {
    name: String,
    func: SystemFn,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// The deterministic tick loop.
pub struct TickLoop {
    world: World,
    context: TickContext,
    systems: Vec<RegisteredSystem>,
    tick_counter: u64,
    last_diagnostics: TickDiagnostics,
}

impl TickLoop {
    pub fn new(world: World, context: TickContext) -> Self {
        Self {
            world,
            context,
            systems: Vec::new(),
            tick_counter: 0,
            last_diagnostics: TickDiagnostics::default(),
        }
    }

    /// Register a system to be run each tick, after all earlier ones.
    ///
    /// # Panics
    ///
    /// Panics if a system with the same name is already registered.
    pub fn add_system(&mut self, name: &str, func: SystemFn) {
        assert!(
            !self.systems.iter().any(|s| s.name == name),
            "duplicate system name: {name:?}"
        );
        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            func,
        });
    }

    /// Execute one tick. Stops at the first failing system.
    pub fn tick(&mut self) -> Result<(), EcsError> {
        let tick_start = Instant::now();
        let mut system_times = Vec::with_capacity(self.systems.len());

        for system in &self.systems {
            let sys_start = Instant::now();
            if let Err(e) = (system.func)(&mut self.world, &mut self.context) {
                tracing::warn!(system = %system.name, tick = self.tick_counter, error = %e, "system failed");
                return Err(e);
            }
            system_times.push((system.name.clone(), sys_start.elapsed()));
        }

        self.world.advance_version();
        self.tick_counter += 1;
        self.last_diagnostics = TickDiagnostics {
            system_times,
            total_time: tick_start.elapsed(),
        };
        Ok(())
    }

    /// Run `count` ticks in sequence.
    pub fn run_ticks(&mut self, count: u64) -> Result<(), EcsError> {
        for _ in 0..count {
            self.tick()?;
        }
        Ok(())
    }

    // -- accessors ----------------------------------------------------------

    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access to the world, for setup and tests.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn context(&self) -> &TickContext {
        &self.context
    }

    /// The names of all registered systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
