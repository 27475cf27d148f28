//! Worker threads and the barrier protocol that drives them.
//!
//! The main thread is stage 0; workers are stages `1..stage_count`. Every
//! thread walks the same schedule, one op at a time:
//!
//! 1. The main thread prepares the op (`worker_begin`): it merges the
//!    previous op's commands, advances or rebuilds the schedule, switches
//!    readonly mode to match the op, and signals the workers.
//! 2. Every thread runs the op's systems (workers only for multi-threaded,
//!    staged ops).
//! 3. Workers report waiting and park; the main thread waits until all of
//!    them did (`worker_end`), stores the reached position, and goes back
//!    to 1.
//!
//! Once no op remains the main thread signals one last time; workers find
//! the schedule finished and park again. That park is the start gate of the
//! next frame.
//!
//! A system that panics is caught where it runs: the stage stops the op,
//! still arrives at the barrier, and the main thread fails the run once
//! everyone is parked again.
//!
//! Wake-ups are driven by an epoch counter: a parked worker sleeps until the
//! epoch moves past the value it parked on, so neither a spurious wake-up
//! nor a signal sent before the worker reached the condvar is lost.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::context::SystemContext;
use crate::cursor::Cursor;
use crate::error::{PipelineError, Result};
use crate::info::Counters;
use crate::lock::{lock, read, write};
use crate::pipeline::PipelineState;
use crate::store::Storage;
use crate::world::Shared;

/// One run of a pipeline, shared with the workers.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub(crate) pipeline: Arc<RwLock<PipelineState>>,
    pub(crate) delta_time: f32,
    /// Frames completed before this run.
    pub(crate) frame: u64,
    pub(crate) stage_count: usize,
}

#[derive(Debug, Default)]
struct SyncState {
    workers_running: usize,
    workers_waiting: usize,
    quit: bool,
    epoch: u64,
    job: Option<Job>,
    /// Systems that panicked during the current op, as `(stage, message)`.
    panics: Vec<(usize, String)>,
}

/// Reusable barrier between the main thread and its workers.
#[derive(Debug, Default)]
pub(crate) struct WorkerSync {
    state: Mutex<SyncState>,
    /// Workers park on this one.
    worker_cond: Condvar,
    /// The main thread waits on this one.
    sync_cond: Condvar,
}

impl WorkerSync {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn epoch(&self) -> u64 {
        lock(&self.state).epoch
    }

    pub(crate) fn waiting(&self) -> usize {
        lock(&self.state).workers_waiting
    }

    pub(crate) fn running(&self) -> usize {
        lock(&self.state).workers_running
    }

    pub(crate) fn set_job(&self, job: Job) {
        lock(&self.state).job = Some(job);
    }

    fn job(&self) -> Option<Job> {
        lock(&self.state).job.clone()
    }

    fn record_panic(&self, stage_index: usize, message: String) {
        lock(&self.state).panics.push((stage_index, message));
    }

    /// Take the panics recorded since the last call as an error.
    pub(crate) fn take_panics(&self) -> Option<PipelineError> {
        let panics = std::mem::take(&mut lock(&self.state).panics);
        let (stage, message) = panics.first()?;
        Some(PipelineError::OperationFailed(format!(
            "{} system(s) panicked, first on stage {stage}: {message}",
            panics.len()
        )))
    }

    fn register_running(&self) {
        lock(&self.state).workers_running += 1;
        self.sync_cond.notify_all();
    }

    fn unregister_running(&self) {
        let mut state = lock(&self.state);
        state.workers_running = state.workers_running.saturating_sub(1);
    }

    /// Park until the epoch moves past `seen` or quit is requested. Returns
    /// `false` on quit.
    fn park(&self, seen: u64) -> bool {
        let state = lock(&self.state);
        let state = self
            .worker_cond
            .wait_while(state, |s| !s.quit && s.epoch == seen)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !state.quit
    }

    /// Worker side of the barrier: report waiting, then park until the main
    /// thread signals again. Returns `false` on quit.
    pub(crate) fn sync_worker(&self, stage_count: usize) -> bool {
        let mut state = lock(&self.state);
        state.workers_waiting += 1;
        if state.workers_waiting + 1 >= stage_count {
            self.sync_cond.notify_all();
        }
        let seen = state.epoch;
        let state = self
            .worker_cond
            .wait_while(state, |s| !s.quit && s.epoch == seen)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !state.quit
    }

    /// Wake every parked worker.
    pub(crate) fn signal_workers(&self) {
        lock(&self.state).epoch += 1;
        self.worker_cond.notify_all();
    }

    /// Main side of the barrier: block until all `stage_count - 1` workers
    /// are waiting, then reset the waiting count.
    pub(crate) fn wait_for_sync(&self, stage_count: usize) {
        let workers = stage_count.saturating_sub(1);
        let state = lock(&self.state);
        let mut state = self
            .sync_cond
            .wait_while(state, |s| s.workers_waiting < workers)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.workers_waiting = 0;
    }

    fn wait_for_running(&self, workers: usize) {
        let state = lock(&self.state);
        let _state = self
            .sync_cond
            .wait_while(state, |s| s.workers_running < workers)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
    }

    fn quit(&self) {
        lock(&self.state).quit = true;
        self.worker_cond.notify_all();
    }

    fn reset(&self) {
        let mut state = lock(&self.state);
        state.quit = false;
        state.workers_waiting = 0;
        state.job = None;
        state.panics.clear();
    }
}

/// Spawn workers for stages `1..stage_count`.
///
/// # Errors
///
/// Returns [`PipelineError::OperationFailed`] if a thread can't be spawned.
/// Workers spawned before the failure are shut down again.
pub(crate) fn spawn_workers<S: Storage>(
    shared: &Arc<Shared<S>>,
    stage_count: usize,
) -> Result<Vec<JoinHandle<()>>> {
    let epoch = shared.sync.epoch();
    let mut handles = Vec::with_capacity(stage_count.saturating_sub(1));
    for stage_index in 1..stage_count {
        let worker_shared = Arc::clone(shared);
        let spawned = std::thread::Builder::new()
            .name(format!("pipeline-worker-{stage_index}"))
            .spawn(move || worker_main(&worker_shared, stage_index, epoch));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                if let Err(join_err) = join_workers(shared, handles) {
                    warn!(error = %join_err, "failed to clean up workers");
                }
                return Err(PipelineError::OperationFailed(format!(
                    "failed to spawn worker {stage_index}: {e}"
                )));
            }
        }
    }
    Ok(handles)
}

/// Stop and join `handles`.
///
/// Waits until every worker is running first, so a thread that hasn't
/// reached its start gate yet can't miss the quit signal.
///
/// # Errors
///
/// Returns [`PipelineError::OperationFailed`] if a worker panicked.
pub(crate) fn join_workers<S>(shared: &Shared<S>, handles: Vec<JoinHandle<()>>) -> Result<()> {
    if handles.is_empty() {
        return Ok(());
    }
    shared.sync.wait_for_running(handles.len());
    shared.sync.quit();

    let mut panicked = 0;
    for handle in handles {
        if handle.join().is_err() {
            panicked += 1;
        }
    }
    shared.sync.reset();

    if panicked > 0 {
        return Err(PipelineError::OperationFailed(format!(
            "{panicked} worker thread(s) panicked"
        )));
    }
    Ok(())
}

fn worker_main<S: Storage>(shared: &Shared<S>, stage_index: usize, start_epoch: u64) {
    shared.sync.register_running();
    trace!(stage = stage_index, "worker started");

    if shared.sync.park(start_epoch) {
        while let Some(job) = shared.sync.job() {
            run_op(shared, &job, stage_index);
            if !shared.sync.sync_worker(job.stage_count) {
                break;
            }
        }
    }

    shared.sync.unregister_running();
    trace!(stage = stage_index, "worker stopped");
}

/// Run `job` to completion on the main thread, driving the workers.
///
/// # Errors
///
/// Returns [`PipelineError::OperationFailed`] if a system panicked on any
/// stage. The rest of the schedule is skipped, and the world leaves
/// readonly mode with the workers parked, ready for the next run.
pub(crate) fn run_pipeline<S: Storage>(shared: &Shared<S>, job: &Job) -> Result<()> {
    shared.sync.set_job(job.clone());

    if !worker_begin(shared, job, true) {
        return Ok(());
    }

    loop {
        let reached = run_op(shared, job, 0);
        worker_end(shared, job);

        if let Some(err) = shared.sync.take_panics() {
            abort_job(shared, job);
            return Err(err);
        }

        // Workers are parked; the cursor can be moved safely.
        if let Some((op, index)) = reached {
            write(&job.pipeline).set_cursor(Cursor::At { op, index });
        }

        if !worker_begin(shared, job, false) {
            break;
        }
    }

    worker_end(shared, job);
    Ok(())
}

/// Unwind a failed run. Workers must be parked.
fn abort_job<S: Storage>(shared: &Shared<S>, job: &Job) {
    if shared.flags.readonly.load(Ordering::Acquire) {
        shared.readonly_end();
    }
    shared.flags.multi_threaded.store(false, Ordering::Release);
    write(&job.pipeline).set_cursor(Cursor::Finished);
}

/// Prepare the next op. Main thread only. Returns `false` if no op remains.
fn worker_begin<S: Storage>(shared: &Shared<S>, job: &Job, start_of_frame: bool) -> bool {
    let merged = shared
        .flags
        .readonly
        .load(Ordering::Acquire)
        .then(|| end_readonly_timed(shared));

    let op = {
        let mut state = write(&job.pipeline);
        // The cursor still points into the op that was just merged.
        if let Some((commands, spent)) = merged {
            state.record_merge(commands, spent);
        }
        if start_of_frame {
            write(&shared.registry).refresh_activity(&shared.store);
        }
        let registry = read(&shared.registry);
        if state.update(&*registry, job.frame, start_of_frame, job.stage_count) {
            Counters::bump(&shared.counters.pipeline_build_count_total);
        }
        state.current_op().copied()
    };

    if let Some(op) = op {
        if !op.no_readonly {
            shared.readonly_begin();
        }
        shared
            .flags
            .multi_threaded
            .store(op.multi_threaded && job.stage_count > 1, Ordering::Release);
        assert_eq!(shared.sync.waiting(), 0, "workers waiting at op start");
        trace!(
            offset = op.offset,
            count = op.count,
            multi_threaded = op.multi_threaded,
            no_readonly = op.no_readonly,
            "begin op"
        );
    }

    if job.stage_count > 1 && (op.is_some() || !start_of_frame) {
        shared.sync.signal_workers();
    }

    op.is_some()
}

/// Leave readonly mode, timing the merge when system time is measured.
fn end_readonly_timed<S: Storage>(shared: &Shared<S>) -> (usize, Duration) {
    let started = shared
        .clock
        .as_ref()
        .filter(|_| shared.flags.measure_system_time.load(Ordering::Relaxed))
        .map(|clock| (clock, clock.now()));
    let commands = shared.readonly_end();
    let spent = started.map_or(Duration::ZERO, |(clock, at)| clock.now().saturating_sub(at));
    (commands, spent)
}

/// Main thread side of the end-of-op barrier.
fn worker_end<S>(shared: &Shared<S>, job: &Job) {
    if job.stage_count > 1 {
        shared.sync.wait_for_sync(job.stage_count);
    }
}

/// Run the systems of the op under the cursor on `stage_index`. Returns the
/// op and the index of the last system reached, or `None` if this stage had
/// nothing to do.
fn run_op<S: Storage>(shared: &Shared<S>, job: &Job, stage_index: usize) -> Option<(usize, usize)> {
    let state = read(&job.pipeline);
    let Cursor::At { op: op_index, index } = state.cursor() else {
        return None;
    };
    let op = state.ops()[op_index];

    // Workers only help with multi-threaded staged ops.
    if stage_index != 0 && !(op.multi_threaded && !op.no_readonly) {
        return None;
    }

    let stage = shared.stage(stage_index)?;
    let clock = shared
        .clock
        .as_ref()
        .filter(|_| stage_index == 0 && shared.flags.measure_system_time.load(Ordering::Relaxed));
    let started = clock.map(|clock| clock.now());

    let systems = state.systems();
    let mut i = index;
    let mut ran_since_merge = i - op.offset;
    while i < systems.len() {
        let id = systems[i];
        let record = read(&shared.registry).get(id);
        match record {
            Some(system) => {
                system.mark_ran(job.frame + 1);
                let mut ctx = SystemContext::new(
                    id,
                    &system.name,
                    job.delta_time,
                    stage_index,
                    job.stage_count,
                    job.frame,
                    !op.no_readonly,
                    shared,
                    &stage,
                );
                let ran = panic::catch_unwind(AssertUnwindSafe(|| system.run(&mut ctx)));
                if let Err(payload) = ran {
                    let message = panic_message(payload.as_ref());
                    error!(system = %system.name, stage = stage_index, %message, "system panicked");
                    shared.sync.record_panic(stage_index, message);
                    break;
                }
                state.record_run(stage_index);
                if stage_index == 0 {
                    Counters::bump(&shared.counters.systems_ran_frame);
                }
            }
            None => debug!(system = id.0, "scheduled system no longer exists"),
        }

        ran_since_merge += 1;
        if ran_since_merge == op.count {
            break;
        }
        i += 1;
    }

    if let (Some(clock), Some(started)) = (clock, started) {
        let spent = clock.now().saturating_sub(started);
        let nanos = u64::try_from(spent.as_nanos()).unwrap_or(u64::MAX);
        shared
            .counters
            .system_time_total_ns
            .fetch_add(nanos, Ordering::Relaxed);
    }

    Some((op_index, i))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
