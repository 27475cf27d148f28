//! The world: systems, pipelines, stages, and the frame loop.
//!
//! A frame is `frame_begin`, one run of the current pipeline, and
//! `frame_end`; [`World::progress`] does all three. Pipelines are created
//! with [`World::pipeline_init`] and selected with [`World::set_pipeline`];
//! every world starts with the builtin pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use engine_term::{Entity, EntityAllocator};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, FrameClock, SystemClock};
use crate::config::WorldConfig;
use crate::error::{PipelineError, Result};
use crate::info::{Counters, WorldInfo};
use crate::lock::{read, write};
use crate::phase;
use crate::pipeline::{PipelineDesc, PipelineQuery, PipelineState, Schedule};
use crate::stage::{self, CommandObserver, Stage};
use crate::store::{ComponentStore, Storage};
use crate::system::{SystemDesc, SystemRegistry};
use crate::worker::{self, Job, WorkerSync};

/// World-wide flags, readable from any thread.
#[derive(Debug, Default)]
pub(crate) struct Flags {
    /// Mutations are queued on stages instead of applied.
    pub(crate) readonly: AtomicBool,
    /// The current op runs on every stage.
    pub(crate) multi_threaded: AtomicBool,
    /// The application was asked to stop.
    pub(crate) quit: AtomicBool,
    pub(crate) measure_system_time: AtomicBool,
}

/// State shared between the main thread and the workers.
pub(crate) struct Shared<S> {
    pub(crate) store: S,
    pub(crate) registry: RwLock<SystemRegistry<S>>,
    pub(crate) stages: RwLock<Vec<Arc<Stage<S>>>>,
    pub(crate) sync: WorkerSync,
    pub(crate) flags: Flags,
    pub(crate) counters: Counters,
    /// Observer active for the frame in progress.
    pub(crate) observer: RwLock<Option<CommandObserver>>,
    pub(crate) clock: Option<Arc<dyn Clock>>,
}

impl<S> Shared<S> {
    pub(crate) fn new(store: S, clock: Option<Arc<dyn Clock>>) -> Self {
        Self {
            store,
            registry: RwLock::new(SystemRegistry::new()),
            stages: RwLock::new(vec![Arc::new(Stage::new(0))]),
            sync: WorkerSync::new(),
            flags: Flags::default(),
            counters: Counters::default(),
            observer: RwLock::new(None),
            clock,
        }
    }

    pub(crate) fn stage(&self, index: usize) -> Option<Arc<Stage<S>>> {
        read(&self.stages).get(index).cloned()
    }

    /// Apply every stage's queued commands.
    pub(crate) fn merge(&self) -> usize {
        let stages = read(&self.stages).clone();
        let observer = read(&self.observer).clone();
        let applied = stage::merge(&stages, &self.store, &self.registry, observer.as_ref());
        Counters::bump(&self.counters.merge_count_total);
        self.counters
            .commands_merged_total
            .fetch_add(u64::try_from(applied).unwrap_or(u64::MAX), Ordering::Relaxed);
        trace!(commands = applied, "merged stages");
        applied
    }

    pub(crate) fn readonly_begin(&self) {
        self.flags.readonly.store(true, Ordering::Release);
    }

    /// Leave readonly mode and merge. Returns the number of commands
    /// applied.
    pub(crate) fn readonly_end(&self) -> usize {
        self.flags.readonly.store(false, Ordering::Release);
        self.merge()
    }
}

/// An entity-component world with a frame pipeline scheduler.
pub struct World<S: Storage = ComponentStore> {
    shared: Arc<Shared<S>>,
    workers: Vec<JoinHandle<()>>,
    stage_count: usize,
    pipelines: HashMap<Entity, Arc<RwLock<PipelineState>>>,
    pipeline: Entity,
    frame_clock: FrameClock,
    allocator: EntityAllocator,
    frame_count_total: u64,
    delta_time: f32,
    delta_time_raw: f32,
    frame_in_progress: bool,
    command_observer: Option<CommandObserver>,
}

impl World<ComponentStore> {
    /// A world over an empty [`ComponentStore`], timed by the system clock.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(ComponentStore::new())
    }
}

impl<S: Storage> World<S> {
    /// A world over `store`, timed by the system clock.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Some(Arc::new(SystemClock::new())))
    }

    /// A world timed by `clock`. Without a clock every frame needs an
    /// explicit delta time.
    #[must_use]
    pub fn with_clock(store: S, clock: Option<Arc<dyn Clock>>) -> Self {
        let mut world = Self {
            shared: Arc::new(Shared::new(store, clock.clone())),
            workers: Vec::new(),
            stage_count: 1,
            pipelines: HashMap::new(),
            pipeline: Entity::INVALID,
            frame_clock: FrameClock::new(clock),
            allocator: EntityAllocator::new(),
            frame_count_total: 0,
            delta_time: 0.0,
            delta_time_raw: 0.0,
            frame_in_progress: false,
            command_observer: None,
        };
        world.pipeline = world.create_pipeline(PipelineDesc::builtin());
        world
    }

    /// Apply a configuration: thread count, pacing, and measurement flags.
    ///
    /// # Errors
    ///
    /// Fails like [`set_threads`](Self::set_threads).
    pub fn configure(&mut self, config: &WorldConfig) -> Result<()> {
        if config.target_fps > 0.0 {
            self.set_target_fps(config.target_fps);
        }
        self.set_time_scale(config.time_scale);
        self.frame_clock.measure_frame_time(config.measure_frame_time);
        self.measure_system_time(config.measure_system_time);
        self.set_threads(config.threads)
    }

    /// Primary storage.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.shared.store
    }

    // -- Frames --

    /// Start a frame. Returns the scaled delta time.
    ///
    /// A `user_delta_time` of `0.0` measures the time since the previous
    /// frame, sleeping first if a target frame rate is set.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidOperation`] if a frame is already in
    /// progress or the world is readonly, and
    /// [`PipelineError::MissingOsApi`] if the delta time must be measured
    /// but the world has no clock.
    pub fn frame_begin(&mut self, user_delta_time: f32) -> Result<f32> {
        if self.is_readonly() {
            return Err(PipelineError::InvalidOperation(
                "cannot begin frame while world is readonly",
            ));
        }
        if self.frame_in_progress {
            return Err(PipelineError::InvalidOperation(
                "frame already in progress",
            ));
        }

        let time = self.frame_clock.begin(user_delta_time)?;
        self.delta_time = time.delta_time;
        self.delta_time_raw = time.delta_time_raw;
        self.shared
            .counters
            .systems_ran_frame
            .store(0, Ordering::Relaxed);
        *write(&self.shared.observer) = self.command_observer.clone();
        self.frame_in_progress = true;

        trace!(
            frame = self.frame_count_total,
            delta_time = time.delta_time,
            "frame begin"
        );
        Ok(time.delta_time)
    }

    /// Finish a frame: merge every stage and advance the frame counter.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidOperation`] if no frame is in
    /// progress or the world is readonly.
    pub fn frame_end(&mut self) -> Result<()> {
        if !self.frame_in_progress {
            return Err(PipelineError::InvalidOperation("no frame in progress"));
        }
        if self.is_readonly() {
            return Err(PipelineError::InvalidOperation(
                "cannot end frame while world is readonly",
            ));
        }

        self.shared.merge();
        self.frame_count_total += 1;
        self.frame_clock.end();
        *write(&self.shared.observer) = None;
        self.frame_in_progress = false;
        Ok(())
    }

    /// Run one frame of the current pipeline. Returns `false` once
    /// [`quit`](Self::quit) was requested.
    ///
    /// The first frame also runs the systems in the `OnStart` phase, once,
    /// on the main thread.
    ///
    /// # Errors
    ///
    /// Fails like [`frame_begin`](Self::frame_begin). Returns
    /// [`PipelineError::OperationFailed`] if a system panicked; the frame is
    /// still ended, so the next call can run normally.
    pub fn progress(&mut self, user_delta_time: f32) -> Result<bool> {
        let delta_time = self.frame_begin(user_delta_time)?;
        let ran = self.run_frame(delta_time);
        self.frame_end()?;
        ran?;
        Ok(!self.should_quit())
    }

    fn run_frame(&self, delta_time: f32) -> Result<()> {
        if self.frame_count_total == 0 {
            self.run_startup()?;
        }

        trace!(delta_time, "progress");
        let pipeline = self.current_pipeline()?;
        self.run_job(pipeline, delta_time, self.stage_count)
    }

    /// Run frames until `max_frames` ran (`0` for no limit) or quit was
    /// requested. Returns the number of frames run.
    ///
    /// # Errors
    ///
    /// Fails like [`progress`](Self::progress).
    pub fn run(&mut self, max_frames: u64) -> Result<u64> {
        info!(
            max_frames,
            threads = self.stage_count,
            target_fps = self.frame_clock.target_fps(),
            "starting frame loop"
        );
        let mut frames = 0;
        loop {
            let keep_going = self.progress(0.0)?;
            frames += 1;
            if !keep_going || (max_frames > 0 && frames >= max_frames) {
                break;
            }
        }
        info!(frames, "frame loop complete");
        Ok(frames)
    }

    /// Run `pipeline` once, outside the frame bookkeeping. Pass
    /// [`Entity::INVALID`] for the current pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `pipeline` is not a
    /// pipeline, [`PipelineError::InvalidOperation`] if the world is
    /// readonly, and [`PipelineError::OperationFailed`] if a system panicked.
    pub fn run_pipeline(&mut self, pipeline: Entity, delta_time: f32) -> Result<()> {
        if self.is_readonly() {
            return Err(PipelineError::InvalidOperation(
                "cannot run pipeline while world is readonly",
            ));
        }
        let pipeline = if pipeline.is_valid() {
            self.pipeline_state(pipeline)?
        } else {
            self.current_pipeline()?
        };
        self.run_job(pipeline, delta_time, self.stage_count)
    }

    fn run_job(
        &self,
        pipeline: Arc<RwLock<PipelineState>>,
        delta_time: f32,
        stage_count: usize,
    ) -> Result<()> {
        let job = Job {
            pipeline,
            delta_time,
            frame: self.frame_count_total,
            stage_count,
        };
        worker::run_pipeline(&self.shared, &job)
    }

    fn run_startup(&self) -> Result<()> {
        let has_startup = read(&self.shared.registry)
            .systems_in_phase(phase::ON_START)
            .next()
            .is_some();
        if !has_startup {
            return Ok(());
        }

        debug!("running startup systems");
        let desc = PipelineDesc::startup();
        let state = PipelineState::new(desc.name, PipelineQuery::new(desc.phases, desc.query));
        // Startup systems never run on workers.
        self.run_job(Arc::new(RwLock::new(state)), 0.0, 1)
    }

    // -- Pipelines --

    /// Create a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `desc` has no phases.
    pub fn pipeline_init(&mut self, desc: PipelineDesc) -> Result<Entity> {
        if desc.phases.is_empty() {
            return Err(PipelineError::InvalidParameter(format!(
                "pipeline '{}' has no phases",
                desc.name
            )));
        }
        Ok(self.create_pipeline(desc))
    }

    fn create_pipeline(&mut self, desc: PipelineDesc) -> Entity {
        let id = self.allocator.allocate();
        info!(pipeline = %desc.name, id = id.0, phases = desc.phases.len(), "created pipeline");
        let state = PipelineState::new(desc.name, PipelineQuery::new(desc.phases, desc.query));
        self.pipelines.insert(id, Arc::new(RwLock::new(state)));
        id
    }

    /// Make `pipeline` the one [`progress`](Self::progress) runs.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `pipeline` is not a
    /// pipeline.
    pub fn set_pipeline(&mut self, pipeline: Entity) -> Result<()> {
        self.pipeline_state(pipeline)?;
        self.pipeline = pipeline;
        Ok(())
    }

    #[must_use]
    pub fn get_pipeline(&self) -> Entity {
        self.pipeline
    }

    /// Snapshot of a pipeline's schedule, as of its last build.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `pipeline` is not a
    /// pipeline.
    pub fn schedule(&self, pipeline: Entity) -> Result<Schedule> {
        let state = self.pipeline_state(pipeline)?;
        Ok(read(&state).schedule())
    }

    /// Systems each stage ran in the last frame.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `pipeline` is not a
    /// pipeline.
    pub fn stage_runs(&self, pipeline: Entity) -> Result<Vec<usize>> {
        let state = self.pipeline_state(pipeline)?;
        Ok(read(&state).stage_runs())
    }

    fn pipeline_state(&self, pipeline: Entity) -> Result<Arc<RwLock<PipelineState>>> {
        self.pipelines
            .get(&pipeline)
            .cloned()
            .ok_or_else(|| PipelineError::InvalidParameter(format!("{pipeline} is not a pipeline")))
    }

    fn current_pipeline(&self) -> Result<Arc<RwLock<PipelineState>>> {
        self.pipeline_state(self.pipeline)
    }

    // -- Systems --

    /// Register a system and return its id.
    pub fn register_system(&mut self, desc: SystemDesc<S>) -> Entity {
        let id = self.allocator.allocate();
        write(&self.shared.registry).register(id, desc);
        id
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `id` isn't a system.
    pub fn enable_system(&mut self, id: Entity) -> Result<()> {
        write(&self.shared.registry).set_enabled(id, true)
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `id` isn't a system.
    pub fn disable_system(&mut self, id: Entity) -> Result<()> {
        write(&self.shared.registry).set_enabled(id, false)
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `id` isn't a system.
    pub fn delete_system(&mut self, id: Entity) -> Result<()> {
        write(&self.shared.registry).remove(id)
    }

    /// Frame marker of the last frame `id` ran in (`0` if never).
    #[must_use]
    pub fn system_last_frame(&self, id: Entity) -> Option<u64> {
        read(&self.shared.registry).get(id).map(|s| s.last_frame())
    }

    // -- Threads --

    /// Use `threads` stages, the main thread included. `0` and `1` both
    /// stop every worker.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidOperation`] if the world is readonly
    /// and [`PipelineError::OperationFailed`] if a thread can't be spawned
    /// or joined.
    pub fn set_threads(&mut self, threads: usize) -> Result<()> {
        if self.is_readonly() {
            return Err(PipelineError::InvalidOperation(
                "cannot change threads while world is readonly",
            ));
        }
        let stage_count = threads.max(1);
        if stage_count == self.stage_count {
            return Ok(());
        }

        self.stop_workers()?;

        // Nothing may be left behind in a stage that's about to go away.
        self.shared.merge();
        *write(&self.shared.stages) = (0..stage_count).map(|i| Arc::new(Stage::new(i))).collect();

        self.workers = worker::spawn_workers(&self.shared, stage_count)?;
        self.stage_count = stage_count;
        info!(threads = stage_count, "set threads");
        Ok(())
    }

    fn stop_workers(&mut self) -> Result<()> {
        let workers = std::mem::take(&mut self.workers);
        let stopped = workers.len();
        let result = worker::join_workers(&self.shared, workers);
        self.stage_count = 1;
        if stopped > 0 {
            debug!(workers = stopped, "stopped workers");
        }
        result
    }

    /// Number of stages, the main thread included.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stage_count
    }

    /// Number of worker threads currently running.
    #[must_use]
    pub fn workers_running(&self) -> usize {
        self.shared.sync.running()
    }

    // -- Time --

    /// Pace frames to `fps`. `0.0` disables pacing.
    pub fn set_target_fps(&mut self, fps: f32) {
        self.frame_clock.set_target_fps(fps);
    }

    pub fn set_time_scale(&mut self, scale: f32) {
        self.frame_clock.set_time_scale(scale);
    }

    /// Zero the accumulated world time.
    pub fn reset_clock(&mut self) {
        self.frame_clock.reset();
    }

    pub fn measure_frame_time(&mut self, enable: bool) {
        self.frame_clock.measure_frame_time(enable);
    }

    pub fn measure_system_time(&mut self, enable: bool) {
        self.shared
            .flags
            .measure_system_time
            .store(enable, Ordering::Relaxed);
    }

    // -- Misc --

    /// Ask the frame loop to stop after the current frame.
    pub fn quit(&self) {
        self.shared.flags.quit.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn should_quit(&self) -> bool {
        self.shared.flags.quit.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.shared.flags.readonly.load(Ordering::Acquire)
    }

    /// Returns `true` if the op in progress runs on every stage.
    #[must_use]
    pub fn is_multi_threaded(&self) -> bool {
        self.shared.flags.multi_threaded.load(Ordering::Acquire)
    }

    /// Observe every command applied during merges. The observer is armed
    /// by `frame_begin` and disarmed by `frame_end`.
    pub fn set_command_observer(&mut self, observer: Option<CommandObserver>) {
        self.command_observer = observer;
    }

    #[must_use]
    pub fn info(&self) -> WorldInfo {
        let counters = &self.shared.counters;
        WorldInfo {
            frame_count_total: self.frame_count_total,
            delta_time: self.delta_time,
            delta_time_raw: self.delta_time_raw,
            time_scale: self.frame_clock.time_scale(),
            target_fps: self.frame_clock.target_fps(),
            world_time_total: self.frame_clock.world_time_total(),
            world_time_total_raw: self.frame_clock.world_time_total_raw(),
            frame_time_total: self.frame_clock.frame_time_total(),
            system_time_total: Duration::from_nanos(Counters::get(&counters.system_time_total_ns))
                .as_secs_f64(),
            merge_count_total: Counters::get(&counters.merge_count_total),
            commands_merged_total: Counters::get(&counters.commands_merged_total),
            pipeline_build_count_total: Counters::get(&counters.pipeline_build_count_total),
            systems_ran_frame: Counters::get(&counters.systems_ran_frame),
        }
    }
}

impl<S: Storage> Drop for World<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_workers() {
            warn!(error = %e, "failed to stop workers");
        }
    }
}

impl<S: Storage> std::fmt::Debug for World<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("stage_count", &self.stage_count)
            .field("pipelines", &self.pipelines.len())
            .field("pipeline", &self.pipeline)
            .field("frame_count_total", &self.frame_count_total)
            .field("frame_in_progress", &self.frame_in_progress)
            .finish_non_exhaustive()
    }
}
