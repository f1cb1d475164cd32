//! Strata Sim -- deterministic workload driver for the Strata chunk store.
//!
//! This crate builds on [`strata_ecs`] to run a seeded, fixed-order tick
//! loop: movement over chunk columns (serial or fork-join), per-team
//! regeneration through shared-value filters, structural churn that moves
//! entities between archetypes, and change-version observation.
//!
//! # Quick Start
//!
//! ```
//! use strata_sim::config::SimConfig;
//!
//! let config = SimConfig { entity_count: 100, ticks: 5, ..Default::default() };
//! let report = strata_sim::run(&config).unwrap();
//! assert_eq!(report.ticks, 5);
//! assert_eq!(report.entity_count, 100);
//! ```

#![deny(unsafe_code)]

pub mod components;
pub mod config;
pub mod systems;
pub mod tick;

use std::time::Instant;

use anyhow::Context;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::Serialize;
use strata_ecs::prelude::*;

use crate::components::{register_all, Frozen, Health, Position, Team, Velocity};
use crate::config::SimConfig;
use crate::tick::{SimQueries, TickContext, TickLoop};

/// Re-export the store crate for convenience.
pub use strata_ecs;

// ---------------------------------------------------------------------------
// SimReport
// ---------------------------------------------------------------------------

/// Summary of a finished run. Contains no timing, so equal configs give
/// equal reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimReport {
    pub ticks: u64,
    pub entity_count: usize,
    pub archetype_count: usize,
    pub chunk_count: usize,
    pub pooled_chunk_count: usize,
    pub shared_value_count: usize,
    pub structural_moves: u64,
    /// Chunks whose positions changed during the final tick.
    pub changed_chunks: usize,
    pub total_health: u64,
    /// Hex-encoded [`World::state_hash`].
    pub state_hash: String,
}

impl SimReport {
    pub fn from_loop(tick_loop: &TickLoop) -> Result<Self, EcsError> {
        let world = tick_loop.world();
        let ctx = tick_loop.context();
        let total_health = world
            .collect_component::<Health>(ctx.queries.healers)?
            .iter()
            .map(|h| u64::from(h.0))
            .sum();
        Ok(Self {
            ticks: tick_loop.tick_count(),
            entity_count: world.entity_count(),
            archetype_count: world.archetypes().len(),
            chunk_count: world.chunk_count(),
            pooled_chunk_count: world.pooled_chunk_count(),
            shared_value_count: world.shared_value_count(),
            structural_moves: ctx.structural_moves,
            changed_chunks: ctx.changed_chunks,
            total_health,
            state_hash: world.state_hash()?.to_hex().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Setup and run
// ---------------------------------------------------------------------------

/// Build the world, spawn the population and register the systems.
pub fn build(config: &SimConfig) -> Result<TickLoop, EcsError> {
    let mut world = World::with_config(config.store.clone())?;
    register_all(&mut world);

    let mut rng = Pcg64::seed_from_u64(config.seed);
    let mut live = Vec::with_capacity(config.entity_count);
    for _ in 0..config.entity_count {
        live.push(systems::spawn_one(&mut world, &mut rng, config.teams)?);
    }

    let queries = SimQueries {
        movers: world
            .query()
            .write::<Position>()
            .read::<Velocity>()
            .none::<Frozen>()
            .compile()?,
        healers: world.query().write::<Health>().read::<Team>().compile()?,
        positions: world.query().read::<Position>().compile()?,
    };
    let context = TickContext {
        rng,
        queries,
        teams: config.teams,
        structural_churn: config.structural_churn,
        parallel: config.parallel,
        live,
        last_version: world.version(),
        changed_chunks: 0,
        structural_moves: 0,
    };

    let mut tick_loop = TickLoop::new(world, context);
    tick_loop.add_system("integrate", systems::integrate);
    tick_loop.add_system("regenerate", systems::regenerate);
    tick_loop.add_system("churn", systems::churn);
    tick_loop.add_system("observe_changes", systems::observe_changes);
    Ok(tick_loop)
}

/// Run `config` to completion and summarize the final state.
pub fn run(config: &SimConfig) -> anyhow::Result<SimReport> {
    config.validate()?;
    let start = Instant::now();
    let mut tick_loop = build(config).context("building the simulation")?;
    tick_loop
        .run_ticks(config.ticks)
        .with_context(|| format!("running {} ticks", config.ticks))?;
    let report = SimReport::from_loop(&tick_loop)?;

    tracing::info!(
        seed = config.seed,
        ticks = report.ticks,
        entities = report.entity_count,
        archetypes = report.archetype_count,
        chunks = report.chunk_count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        state_hash = %report.state_hash,
        "simulation finished"
    );
    Ok(report)
}
