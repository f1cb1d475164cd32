//! Component types used by the simulation workload.

use strata_ecs::prelude::*;

/// 2D position.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// 2D velocity, applied to [`Position`] once per tick.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Velocity {
    pub dx: f32,
    pub dy: f32,
}

/// Hit points, regenerated per team.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Health(pub u32);

/// Tag: frozen entities are skipped by the movement system.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Frozen;

/// Shared team membership. Entities of one team share chunks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Team(pub u8);

/// Maximum [`Health`].
pub const MAX_HEALTH: u32 = 100;

/// Register every simulation component on `world`.
pub fn register_all(world: &mut World) {
    world.register_component::<Position>("position");
    world.register_component::<Velocity>("velocity");
    world.register_component::<Health>("health");
    world.register_component::<Frozen>("frozen");
    world.register_shared_component::<Team>("team");
}
