//! Property tests for the chunk store.
//!
//! Random sequences of structural operations are applied to a world and to a
//! plain `HashMap` model. After each sequence the world must agree with the
//! model, every chunk must be dense, and every live entity must resolve to
//! the slot that holds it.

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use strata_ecs::prelude::*;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
struct Pos {
    x: f32,
    y: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
struct Vel {
    dx: f32,
    dy: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Team(u8);

#[derive(Debug, Clone, PartialEq)]
struct Expected {
    pos: Pos,
    vel: Option<Vel>,
    team: Option<Team>,
}

/// Operations we can perform on the world.
#[derive(Debug, Clone)]
enum StoreOp {
    SpawnPos(f32),
    SpawnPosVel(f32, f32),
    SpawnInTeam(f32, u8),
    Destroy(usize),
    AddVel(usize, f32),
    RemoveVel(usize),
    SetTeam(usize, u8),
    RemoveTeam(usize),
    SetPos(usize, f32),
    AdvanceVersion,
}

/// Strategy that generates finite f32 values.
fn finite_f32() -> impl Strategy<Value = f32> {
    (-10_000i32..10_000i32).prop_map(|v| v as f32 * 0.5)
}

fn store_op_strategy() -> impl Strategy<Value = StoreOp> {
    prop_oneof![
        3 => finite_f32().prop_map(StoreOp::SpawnPos),
        3 => (finite_f32(), finite_f32()).prop_map(|(x, dx)| StoreOp::SpawnPosVel(x, dx)),
        3 => (finite_f32(), 0..4u8).prop_map(|(x, t)| StoreOp::SpawnInTeam(x, t)),
        2 => (0..64usize).prop_map(StoreOp::Destroy),
        1 => (0..64usize, finite_f32()).prop_map(|(i, dx)| StoreOp::AddVel(i, dx)),
        1 => (0..64usize).prop_map(StoreOp::RemoveVel),
        1 => (0..64usize, 0..4u8).prop_map(|(i, t)| StoreOp::SetTeam(i, t)),
        1 => (0..64usize).prop_map(StoreOp::RemoveTeam),
        1 => (0..64usize, finite_f32()).prop_map(|(i, x)| StoreOp::SetPos(i, x)),
        1 => Just(StoreOp::AdvanceVersion),
    ]
}

fn setup_world() -> World {
    // Small chunks so that sequences span many chunks and releases.
    let mut world = World::with_config(StoreConfig { chunk_bytes: 128 }).unwrap();
    world.register_component::<Pos>("pos");
    world.register_component::<Vel>("vel");
    world.register_shared_component::<Team>("team");
    world
}

fn pick(alive: &[EntityId], i: usize) -> Option<EntityId> {
    if alive.is_empty() {
        None
    } else {
        Some(alive[i % alive.len()])
    }
}

fn apply(world: &mut World, model: &mut HashMap<EntityId, Expected>, alive: &mut Vec<EntityId>, op: StoreOp) {
    match op {
        StoreOp::SpawnPos(x) => {
            let pos = Pos { x, y: 0.0 };
            let e = world.spawn_with(pos).unwrap();
            model.insert(e, Expected { pos, vel: None, team: None });
            alive.push(e);
        }
        StoreOp::SpawnPosVel(x, dx) => {
            let pos = Pos { x, y: 1.0 };
            let vel = Vel { dx, dy: 0.0 };
            let mut b = ComponentBundle::new();
            b.add(world.registry(), pos);
            b.add(world.registry(), vel);
            let e = world.spawn_bundle(b).unwrap();
            model.insert(e, Expected { pos, vel: Some(vel), team: None });
            alive.push(e);
        }
        StoreOp::SpawnInTeam(x, t) => {
            let pos = Pos { x, y: 2.0 };
            let mut b = ComponentBundle::new();
            b.add(world.registry(), pos);
            b.add_shared(world.registry(), Team(t));
            let e = world.spawn_bundle(b).unwrap();
            model.insert(e, Expected { pos, vel: None, team: Some(Team(t)) });
            alive.push(e);
        }
        StoreOp::Destroy(i) => {
            if let Some(e) = pick(alive, i) {
                world.destroy_entity(e).unwrap();
                model.remove(&e);
                alive.retain(|&a| a != e);
                assert!(matches!(world.destroy_entity(e), Err(EcsError::StaleEntity { .. })));
            }
        }
        StoreOp::AddVel(i, dx) => {
            if let Some(e) = pick(alive, i) {
                let vel = Vel { dx, dy: dx };
                world.add_component(e, vel).unwrap();
                model.get_mut(&e).unwrap().vel = Some(vel);
            }
        }
        StoreOp::RemoveVel(i) => {
            if let Some(e) = pick(alive, i) {
                world.remove_component::<Vel>(e).unwrap();
                model.get_mut(&e).unwrap().vel = None;
            }
        }
        StoreOp::SetTeam(i, t) => {
            if let Some(e) = pick(alive, i) {
                world.add_shared_component(e, Team(t)).unwrap();
                model.get_mut(&e).unwrap().team = Some(Team(t));
            }
        }
        StoreOp::RemoveTeam(i) => {
            if let Some(e) = pick(alive, i) {
                world.remove_component::<Team>(e).unwrap();
                model.get_mut(&e).unwrap().team = None;
            }
        }
        StoreOp::SetPos(i, x) => {
            if let Some(e) = pick(alive, i) {
                let pos = Pos { x, y: -x };
                world.set_component(e, pos).unwrap();
                model.get_mut(&e).unwrap().pos = pos;
            }
        }
        StoreOp::AdvanceVersion => {
            world.advance_version();
        }
    }
}

fn check_invariants(world: &World, model: &HashMap<EntityId, Expected>) {
    assert_eq!(world.entity_count(), model.len());

    // Every chunk is dense and non-empty; archetype counts add up.
    let mut records = 0;
    for archetype in world.archetypes() {
        let mut in_chunks = 0;
        for &chunk_id in archetype.chunks() {
            let chunk = world.chunk(chunk_id).unwrap();
            assert!(chunk.count() > 0, "empty chunk {chunk_id:?} left in {:?}", archetype.id());
            assert!(chunk.count() <= chunk.capacity());
            assert_eq!(chunk.entities().len(), chunk.count());
            in_chunks += chunk.count();
        }
        assert_eq!(in_chunks, archetype.entity_count());
        records += in_chunks;
    }
    assert_eq!(records, model.len());

    // Every live entity resolves to the slot holding it, with its values.
    for (&e, expected) in model {
        let loc = world.resolve(e).unwrap();
        assert_eq!(world.chunk(loc.chunk).unwrap().entities()[loc.slot], e);
        assert_eq!(world.get_component::<Pos>(e).unwrap(), expected.pos);
        match expected.vel {
            Some(vel) => assert_eq!(world.get_component::<Vel>(e).unwrap(), vel),
            None => assert!(!world.has_component::<Vel>(e)),
        }
        match &expected.team {
            Some(team) => assert_eq!(&world.get_shared_component::<Team>(e).unwrap(), team),
            None => assert!(!world.has_component::<Team>(e)),
        }
    }

    // Shared values are freed once no chunk refers to them.
    let teams: BTreeSet<u8> = model.values().filter_map(|x| x.team.as_ref().map(|t| t.0)).collect();
    assert_eq!(world.shared_value_count(), teams.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1_000))]

    #[test]
    fn random_ops_keep_chunks_dense(ops in prop::collection::vec(store_op_strategy(), 1..80)) {
        let mut world = setup_world();
        let mut model = HashMap::new();
        let mut alive = Vec::new();
        for op in ops {
            apply(&mut world, &mut model, &mut alive, op);
        }
        check_invariants(&world, &model);
    }

    #[test]
    fn iteration_visits_each_live_entity_once(ops in prop::collection::vec(store_op_strategy(), 1..80)) {
        let mut world = setup_world();
        let mut model = HashMap::new();
        let mut alive = Vec::new();
        for op in ops {
            apply(&mut world, &mut model, &mut alive, op);
        }

        let q = world.query().read::<Pos>().compile().unwrap();
        let visited = world.collect_entities(q).unwrap();
        let unique: BTreeSet<EntityId> = visited.iter().copied().collect();
        prop_assert_eq!(visited.len(), model.len());
        prop_assert_eq!(unique.len(), model.len());
        prop_assert_eq!(world.calculate_length(q).unwrap(), model.len());

        // Seeking by logical index agrees with sequential order.
        let mut iter = world.iter_chunks(q).unwrap();
        for (index, &e) in visited.iter().enumerate().rev() {
            let slot = iter.move_to_entity_index(index).unwrap();
            prop_assert_eq!(iter.entities()[slot], e);
        }
        prop_assert_eq!(iter.move_to_entity_index(visited.len()), None);
    }

    #[test]
    fn shared_filter_partitions_team_members(ops in prop::collection::vec(store_op_strategy(), 1..80)) {
        let mut world = setup_world();
        let mut model = HashMap::new();
        let mut alive = Vec::new();
        for op in ops {
            apply(&mut world, &mut model, &mut alive, op);
        }

        let q = world.query().read::<Pos>().read::<Team>().compile().unwrap();
        for t in 0..4u8 {
            world.set_shared_filter(q, Team(t)).unwrap();
            let expected = model.values().filter(|x| x.team == Some(Team(t))).count();
            prop_assert_eq!(world.calculate_length(q).unwrap(), expected);
        }
        world.release_query(q).unwrap();
        check_invariants(&world, &model);
    }
}
