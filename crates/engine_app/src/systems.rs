//! Particle systems.
//!
//! Positions and velocities are [`Vec3`]s stored as JSON arrays.

use engine_pipeline::{ComponentStore, SystemDesc, World, phase};
use engine_term::{Entity, Id, QueryDesc};
use glam::Vec3;
use serde_json::Value;
use tracing::{debug, info};

pub const POSITION: Id = Id::from_name("Position");
pub const VELOCITY: Id = Id::from_name("Velocity");

const GRAVITY: Vec3 = Vec3::new(0.0, -9.81, 0.0);
const RESTITUTION: f32 = 0.8;
const REPORT_EVERY: u64 = 60;

/// Register every demo system on `world`.
pub fn register(world: &mut World, entities: usize) {
    world.register_system(spawn(entities));
    world.register_system(integrate());
    world.register_system(bounce());
    world.register_system(report());
}

fn get(store: &ComponentStore, entity: Entity, id: Id) -> Option<Vec3> {
    store.get(entity, id).and_then(|v| serde_json::from_value(v).ok())
}

fn value(v: Vec3) -> Value {
    serde_json::json!([v.x, v.y, v.z])
}

/// Startup: create the particles on a grid, at varying heights.
fn spawn(count: usize) -> SystemDesc<ComponentStore> {
    SystemDesc::<ComponentStore>::new("spawn", move |ctx| {
        ctx.defer(move |store: &ComponentStore| {
            for i in 0..count {
                let position = Vec3::new((i % 32) as f32, 5.0 + (i % 7) as f32, (i / 32) as f32);
                let velocity = Vec3::new(0.0, (i % 5) as f32, 0.0);
                let e = store.spawn();
                store.set(e, POSITION, value(position));
                store.set(e, VELOCITY, value(velocity));
            }
        });
        info!(count, "spawned particles");
    })
    .phase(phase::ON_START)
    .query(QueryDesc::new().writes_to(POSITION).writes_to(VELOCITY))
    .no_readonly(true)
}

/// Apply gravity and move every particle. Each stage takes a slice.
fn integrate() -> SystemDesc<ComponentStore> {
    SystemDesc::<ComponentStore>::new("integrate", |ctx| {
        let dt = ctx.delta_time();
        let matched = ctx.store().query(&QueryDesc::new().with(POSITION).with(VELOCITY));
        for &e in &matched[ctx.partition(matched.len())] {
            let (Some(position), Some(velocity)) = (
                get(ctx.store(), e, POSITION),
                get(ctx.store(), e, VELOCITY),
            ) else {
                continue;
            };
            let velocity = velocity + GRAVITY * dt;
            let position = position + velocity * dt;
            // Owned components of our own slice: written in place.
            ctx.store().set(e, VELOCITY, value(velocity));
            ctx.store().set(e, POSITION, value(position));
        }
    })
    .query(QueryDesc::new().write(POSITION).write(VELOCITY))
    .multi_threaded(true)
}

/// Reflect particles that fell through the ground. Runs unstaged, so it
/// sees this frame's integration and its writes land immediately.
fn bounce() -> SystemDesc<ComponentStore> {
    SystemDesc::<ComponentStore>::new("bounce", |ctx| {
        let store = ctx.store();
        let mut bounced = 0;
        for e in store.query(&QueryDesc::new().with(POSITION).with(VELOCITY)) {
            let (Some(position), Some(velocity)) =
                (get(store, e, POSITION), get(store, e, VELOCITY))
            else {
                continue;
            };
            if position.y < 0.0 && velocity.y < 0.0 {
                store.set(e, POSITION, value(position.with_y(0.0)));
                store.set(e, VELOCITY, value(velocity.with_y(-velocity.y * RESTITUTION)));
                bounced += 1;
            }
        }
        if bounced > 0 {
            debug!(bounced, "particles bounced");
        }
    })
    .phase(phase::ON_VALIDATE)
    .query(QueryDesc::new().read(POSITION).write(VELOCITY))
    .no_readonly(true)
}

/// Log the mean particle height every few frames.
fn report() -> SystemDesc<ComponentStore> {
    SystemDesc::<ComponentStore>::new("report", |ctx| {
        if ctx.frame() % REPORT_EVERY != 0 {
            return;
        }
        let store = ctx.store();
        let heights: Vec<f32> = store
            .query(&QueryDesc::new().with(POSITION))
            .into_iter()
            .filter_map(|e| get(store, e, POSITION))
            .map(|p| p.y)
            .collect();
        if heights.is_empty() {
            return;
        }
        let mean = heights.iter().sum::<f32>() / heights.len() as f32;
        info!(frame = ctx.frame(), particles = heights.len(), mean_height = mean, "report");
    })
    .phase(phase::POST_FRAME)
    .query(QueryDesc::new().read(POSITION))
}
