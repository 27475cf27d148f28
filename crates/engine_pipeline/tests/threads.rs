//! Multi-threaded execution: stages, barriers, and equivalence with a
//! single-threaded run.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use engine_pipeline::{ComponentStore, PipelineError, SystemDesc, World};
use engine_term::{Entity, Id, QueryDesc};
use serde_json::json;

const ENTITIES: i64 = 101;

fn ids() -> (Id, Id) {
    (Id::from_name("A"), Id::from_name("B"))
}

/// Two multi-threaded systems over every entity: `bump` increments A through
/// a sourceless write, `derive` reads A and stores `2 * A` in B. The
/// sourceless write forces a merge between them.
fn populated(threads: usize) -> (World, Vec<Entity>) {
    let (a, b) = ids();
    let mut world = World::with_clock(ComponentStore::new(), None);
    let entities: Vec<Entity> = (0..ENTITIES)
        .map(|i| {
            let e = world.store().spawn();
            world.store().set(e, a, json!(i));
            world.store().set(e, b, json!(0));
            e
        })
        .collect();

    world.register_system(
        SystemDesc::<ComponentStore>::new("bump", move |ctx| {
            let matched = ctx.store().query(&QueryDesc::new().with(a));
            for &e in &matched[ctx.partition(matched.len())] {
                ctx.defer(move |store: &ComponentStore| {
                    store.update(e, a, |v| *v = json!(v.as_i64().unwrap_or(0) + 1));
                });
            }
        })
        .query(QueryDesc::new().writes_to(a))
        .multi_threaded(true),
    );
    world.register_system(
        SystemDesc::<ComponentStore>::new("derive", move |ctx| {
            let matched = ctx.store().query(&QueryDesc::new().with(a));
            for &e in &matched[ctx.partition(matched.len())] {
                let seen = ctx.store().get(e, a).and_then(|v| v.as_i64()).unwrap_or(0);
                ctx.defer(move |store: &ComponentStore| {
                    store.set(e, b, json!(seen * 2));
                });
            }
        })
        .query(QueryDesc::new().read(a).write(b))
        .multi_threaded(true),
    );

    world.set_threads(threads).unwrap();
    (world, entities)
}

fn snapshot(world: &World, entities: &[Entity]) -> Vec<(i64, i64)> {
    let (a, b) = ids();
    entities
        .iter()
        .map(|&e| {
            let get = |id| world.store().get(e, id).and_then(|v| v.as_i64()).unwrap_or(-1);
            (get(a), get(b))
        })
        .collect()
}

#[test]
fn test_threads_match_single_threaded() {
    let (mut single, single_entities) = populated(1);
    let (mut multi, multi_entities) = populated(4);
    assert_eq!(multi.stage_count(), 4);

    for _ in 0..10 {
        single.progress(0.1).unwrap();
        multi.progress(0.1).unwrap();
    }

    let expected = snapshot(&single, &single_entities);
    assert_eq!(snapshot(&multi, &multi_entities), expected);
    assert_eq!(expected[0], (10, 20));
    assert_eq!(expected[100], (110, 220));
}

#[test]
fn test_every_stage_runs_multi_threaded_ops() {
    let (mut world, _) = populated(4);
    world.progress(0.1).unwrap();

    let runs = world.stage_runs(world.get_pipeline()).unwrap();
    assert_eq!(runs, vec![2, 2, 2, 2], "two systems on each of four stages");
    assert_eq!(world.info().systems_ran_frame, 2);
}

#[test]
fn test_single_threaded_ops_stay_on_main() {
    let stages = Arc::new(Mutex::new(BTreeSet::new()));
    let main_only = Arc::new(Mutex::new(BTreeSet::new()));
    let mut world = World::with_clock(ComponentStore::new(), None);

    let seen = Arc::clone(&stages);
    world.register_system(
        SystemDesc::new("spread", move |ctx| {
            seen.lock().unwrap().insert(ctx.stage_index());
        })
        .multi_threaded(true),
    );
    for (name, no_readonly) in [("plain", false), ("immediate", true)] {
        let seen = Arc::clone(&main_only);
        world.register_system(
            SystemDesc::new(name, move |ctx| {
                seen.lock().unwrap().insert(ctx.stage_index());
            })
            .no_readonly(no_readonly),
        );
    }
    // An immediate system asking for threads still runs on main only.
    let seen = Arc::clone(&main_only);
    world.register_system(
        SystemDesc::new("immediate_threaded", move |ctx| {
            assert!(!ctx.is_staged());
            seen.lock().unwrap().insert(ctx.stage_index());
        })
        .multi_threaded(true)
        .no_readonly(true),
    );

    world.set_threads(3).unwrap();
    for _ in 0..3 {
        world.progress(0.1).unwrap();
    }

    assert_eq!(*stages.lock().unwrap(), BTreeSet::from([0, 1, 2]));
    assert_eq!(*main_only.lock().unwrap(), BTreeSet::from([0]));
}

#[test]
fn test_many_frames_through_the_barrier() {
    let (mut world, entities) = populated(3);
    // Mixed ops keep workers parking and waking several times per frame.
    world.register_system(SystemDesc::new("main_only", |_| {}).no_readonly(true));
    world.register_system(SystemDesc::new("tail", |_| {}).multi_threaded(true));

    for _ in 0..250 {
        assert!(world.progress(0.01).unwrap());
    }

    let values = snapshot(&world, &entities);
    assert_eq!(values[0], (250, 500));
    assert_eq!(world.info().frame_count_total, 250);
    assert_eq!(world.workers_running(), 2);
}

#[test]
fn test_changing_threads_between_frames() {
    let (mut world, entities) = populated(4);
    world.progress(0.1).unwrap();

    for threads in [2, 1, 3, 0, 4] {
        world.set_threads(threads).unwrap();
        assert_eq!(world.stage_count(), threads.max(1));
        world.progress(0.1).unwrap();
        assert_eq!(
            world.stage_runs(world.get_pipeline()).unwrap().len(),
            threads.max(1)
        );
    }

    assert_eq!(snapshot(&world, &entities)[0], (6, 12));
}

#[test]
fn test_drop_joins_workers() {
    let (mut world, _) = populated(4);
    world.progress(0.1).unwrap();
    drop(world);

    // A fresh world can spawn its own workers right away.
    let (mut world, entities) = populated(2);
    world.progress(0.1).unwrap();
    assert_eq!(snapshot(&world, &entities)[1], (2, 4));
}

#[test]
fn test_worker_panic_fails_the_frame() {
    let mut world = World::with_clock(ComponentStore::new(), None);
    world.register_system(
        SystemDesc::new("fragile", |ctx| {
            if ctx.stage_index() == 1 && ctx.frame() == 0 {
                panic!("worker system failed");
            }
        })
        .multi_threaded(true),
    );
    let after = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&after);
    world.register_system(
        SystemDesc::new("after", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .no_readonly(true),
    );
    world.set_threads(2).unwrap();

    // Run the frame elsewhere so a wedged barrier fails the test instead of
    // hanging it.
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = world.progress(0.1);
        let _ = tx.send((world, result));
    });
    let (mut world, result) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("progress blocked after a worker panic");

    match result {
        Err(PipelineError::OperationFailed(message)) => {
            assert!(message.contains("worker system failed"), "{message}");
            assert!(message.contains("stage 1"), "{message}");
        }
        other => panic!("expected OperationFailed, got {other:?}"),
    }
    assert_eq!(after.load(Ordering::Relaxed), 0, "the rest of the frame is skipped");
    assert!(!world.is_readonly());
    assert_eq!(world.info().frame_count_total, 1);

    // The next frame runs normally on the same workers.
    assert!(world.progress(0.1).unwrap());
    assert_eq!(after.load(Ordering::Relaxed), 1);
    assert_eq!(world.workers_running(), 1);
    drop(world);
}

#[test]
fn test_main_thread_panic_waits_for_workers() {
    let worker_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&worker_runs);
    let mut world = World::with_clock(ComponentStore::new(), None);
    world.register_system(
        SystemDesc::new("split", move |ctx| {
            if ctx.stage_index() == 0 {
                panic!("main stage failed");
            }
            std::thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .multi_threaded(true),
    );
    world.set_threads(3).unwrap();

    let err = world.progress(0.1).unwrap_err();
    assert!(matches!(err, PipelineError::OperationFailed(_)), "{err:?}");
    // Both workers finished the op before the error came back.
    assert_eq!(worker_runs.load(Ordering::Relaxed), 2);
    assert!(!world.is_readonly());
}
