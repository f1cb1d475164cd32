//! The workload's systems and population setup.

use rand::Rng;
use rand_pcg::Pcg64;
use strata_ecs::prelude::*;

use crate::components::{Frozen, Health, Position, Team, Velocity, MAX_HEALTH};
use crate::tick::TickContext;

/// Health lost when an entity gets frozen.
const FREEZE_DAMAGE: u32 = 10;

/// Spawn one entity with random components.
pub fn spawn_one(world: &mut World, rng: &mut Pcg64, teams: u8) -> Result<EntityId, EcsError> {
    let mut bundle = ComponentBundle::new();
    bundle.add(
        world.registry(),
        Position {
            x: rng.gen_range(-100.0..100.0),
            y: rng.gen_range(-100.0..100.0),
        },
    );
    bundle.add(
        world.registry(),
        Velocity {
            dx: rng.gen_range(-1.0..1.0),
            dy: rng.gen_range(-1.0..1.0),
        },
    );
    bundle.add(world.registry(), Health(rng.gen_range(1..=MAX_HEALTH)));
    bundle.add_shared(world.registry(), Team(rng.gen_range(0..teams)));
    world.spawn_bundle(bundle)
}

fn step(positions: &mut [Position], velocities: &[Velocity]) {
    for (p, v) in positions.iter_mut().zip(velocities) {
        p.x += v.dx;
        p.y += v.dy;
    }
}

/// Apply velocity to every unfrozen position.
pub fn integrate(world: &mut World, ctx: &mut TickContext) -> Result<(), EcsError> {
    let movers = ctx.queries.movers;
    if ctx.parallel {
        return world.par_for_each_chunk(movers, |mut view| {
            let (positions, velocities) = view.columns_mut::<Position, Velocity>()?;
            step(positions, velocities);
            Ok(())
        });
    }

    let mut iter = world.iter_chunks(movers)?;
    while iter.move_next() {
        let (positions, velocities) = iter.columns_mut::<Position, Velocity>()?;
        step(positions, velocities);
    }
    Ok(())
}

/// Heal every team by `team + 1`, one shared-filtered pass per team.
pub fn regenerate(world: &mut World, ctx: &mut TickContext) -> Result<(), EcsError> {
    let healers = ctx.queries.healers;
    for team in 0..ctx.teams {
        world.set_shared_filter(healers, Team(team))?;
        let amount = u32::from(team) + 1;
        let mut iter = world.iter_chunks(healers)?;
        while iter.move_next() {
            for health in iter.column_mut::<Health>()? {
                health.0 = (health.0 + amount).min(MAX_HEALTH);
            }
        }
    }
    world.reset_filter(healers)
}

/// Toggle `Frozen` on random entities and recycle one entity.
pub fn churn(world: &mut World, ctx: &mut TickContext) -> Result<(), EcsError> {
    if ctx.live.is_empty() {
        return Ok(());
    }

    let toggles = (ctx.live.len() as f64 * ctx.structural_churn).round() as usize;
    for _ in 0..toggles {
        let entity = ctx.live[ctx.rng.gen_range(0..ctx.live.len())];
        if world.has_component::<Frozen>(entity) {
            world.remove_component::<Frozen>(entity)?;
        } else {
            world.add_component(entity, Frozen)?;
            let health = world.get_component_mut::<Health>(entity)?;
            health.0 = health.0.saturating_sub(FREEZE_DAMAGE);
        }
        ctx.structural_moves += 1;
    }

    let victim = ctx.live.swap_remove(ctx.rng.gen_range(0..ctx.live.len()));
    world.destroy_entity(victim)?;
    let replacement = spawn_one(world, &mut ctx.rng, ctx.teams)?;
    ctx.live.push(replacement);
    ctx.structural_moves += 1;
    Ok(())
}

/// Count chunks whose positions were written since the previous tick.
pub fn observe_changes(world: &mut World, ctx: &mut TickContext) -> Result<(), EcsError> {
    let positions = ctx.queries.positions;
    let position = world.registry().require::<Position>()?;
    world.set_changed_filter(positions, &[position], ctx.last_version)?;
    ctx.changed_chunks = world.calculate_chunk_count(positions)?;
    world.reset_filter(positions)?;
    ctx.last_version = world.version();
    tracing::trace!(changed_chunks = ctx.changed_chunks, "observed position changes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::register_all;
    use crate::tick::SimQueries;
    use rand::SeedableRng;

    fn setup(count: usize, parallel: bool) -> (World, TickContext) {
        let mut world = World::new();
        register_all(&mut world);
        let mut rng = Pcg64::seed_from_u64(42);
        let live = (0..count)
            .map(|_| spawn_one(&mut world, &mut rng, 3).unwrap())
            .collect();
        let queries = SimQueries {
            movers: world
                .query()
                .write::<Position>()
                .read::<Velocity>()
                .none::<Frozen>()
                .compile()
                .unwrap(),
            healers: world.query().write::<Health>().read::<Team>().compile().unwrap(),
            positions: world.query().read::<Position>().compile().unwrap(),
        };
        let ctx = TickContext {
            rng,
            queries,
            teams: 3,
            structural_churn: 0.1,
            parallel,
            live,
            last_version: 0,
            changed_chunks: 0,
            structural_moves: 0,
        };
        (world, ctx)
    }

    #[test]
    fn integrate_skips_frozen_entities() {
        let (mut world, mut ctx) = setup(10, false);
        let frozen = ctx.live[0];
        world.add_component(frozen, Frozen).unwrap();
        let before = world.get_component::<Position>(frozen).unwrap();
        let moving = ctx.live[1];
        let moving_before = world.get_component::<Position>(moving).unwrap();
        let vel = world.get_component::<Velocity>(moving).unwrap();

        integrate(&mut world, &mut ctx).unwrap();
        assert_eq!(world.get_component::<Position>(frozen).unwrap(), before);
        assert_eq!(
            world.get_component::<Position>(moving).unwrap(),
            Position {
                x: moving_before.x + vel.dx,
                y: moving_before.y + vel.dy
            }
        );
    }

    #[test]
    fn parallel_and_serial_integrate_agree() {
        let (mut serial, mut serial_ctx) = setup(500, false);
        let (mut parallel, mut parallel_ctx) = setup(500, true);
        for _ in 0..5 {
            integrate(&mut serial, &mut serial_ctx).unwrap();
            integrate(&mut parallel, &mut parallel_ctx).unwrap();
        }
        assert_eq!(serial.state_hash().unwrap(), parallel.state_hash().unwrap());
    }

    #[test]
    fn regenerate_caps_health() {
        let (mut world, mut ctx) = setup(50, false);
        for _ in 0..MAX_HEALTH {
            regenerate(&mut world, &mut ctx).unwrap();
        }
        let all = world.collect_component::<Health>(ctx.queries.healers).unwrap();
        assert_eq!(all.len(), 50);
        assert!(all.iter().all(|h| h.0 == MAX_HEALTH));
        assert!(world.query_filter(ctx.queries.healers).unwrap().is_none());
    }

    #[test]
    fn churn_keeps_population_size() {
        let (mut world, mut ctx) = setup(40, false);
        for _ in 0..10 {
            churn(&mut world, &mut ctx).unwrap();
        }
        assert_eq!(world.entity_count(), 40);
        assert_eq!(ctx.live.len(), 40);
        assert!(ctx.live.iter().all(|&e| world.exists(e)));
        assert!(ctx.structural_moves >= 10);
    }

    #[test]
    fn observe_changes_tracks_writes_per_tick() {
        let (mut world, mut ctx) = setup(20, false);
        let all_chunks = world.calculate_chunk_count(ctx.queries.positions).unwrap();

        // Spawning stamped every chunk.
        observe_changes(&mut world, &mut ctx).unwrap();
        assert_eq!(ctx.changed_chunks, all_chunks);

        world.advance_version();
        observe_changes(&mut world, &mut ctx).unwrap();
        assert_eq!(ctx.changed_chunks, 0);

        world.advance_version();
        integrate(&mut world, &mut ctx).unwrap();
        observe_changes(&mut world, &mut ctx).unwrap();
        assert_eq!(ctx.changed_chunks, all_chunks);
    }
}
