//! # engine_app
//!
//! Runs a cloud of falling, bouncing particles through the builtin frame
//! pipeline and prints the world statistics as JSON when done.
//!
//! ```text
//! engine_app --threads 4 --fps 60 --frames 300
//! RUST_LOG=engine_pipeline=debug engine_app --frames 2   # show the schedule
//! ```

mod systems;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use engine_pipeline::{CommandEvent, CommandKind, World, WorldConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "engine_app", about = "Frame pipeline demo with worker threads")]
struct Args {
    /// Threads to run systems on, main thread included [default: 4]
    #[arg(short, long)]
    threads: Option<usize>,

    /// Target frames per second, 0 runs unpaced [default: 60]
    #[arg(short, long)]
    fps: Option<f32>,

    /// Frames to run (0 runs until a system quits)
    #[arg(short = 'n', long, default_value_t = 300)]
    frames: u64,

    /// Particles spawned at startup
    #[arg(short, long, default_value_t = 1000)]
    entities: usize,

    /// JSON world configuration; --threads and --fps override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            WorldConfig::from_json(&json)?
        }
        None => WorldConfig {
            measure_system_time: true,
            ..WorldConfig::default()
        }
        .with_threads(4)
        .with_target_fps(60.0),
    };
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }
    if let Some(fps) = args.fps {
        config = config.with_target_fps(fps);
    }
    info!(?config, entities = args.entities, "starting pipeline demo");

    let mut world = World::empty();
    world.configure(&config)?;

    let deferred = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&deferred);
    world.set_command_observer(Some(Arc::new(move |event: CommandEvent| {
        if event.kind == CommandKind::Store {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    })));

    systems::register(&mut world, args.entities);
    let frames = world.run(args.frames)?;

    let schedule = world.schedule(world.get_pipeline())?;
    info!(
        frames,
        ops = schedule.ops.len(),
        systems = schedule.systems.len(),
        rebuilds = schedule.rebuild_count,
        deferred = deferred.load(Ordering::Relaxed),
        "pipeline demo finished"
    );
    println!("{}", serde_json::to_string_pretty(&world.info())?);
    Ok(())
}
