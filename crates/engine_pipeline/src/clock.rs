//! Frame timing.
//!
//! [`FrameClock`] turns a monotonic [`Clock`] into per-frame delta times and,
//! when a target frame rate is configured, paces frames by sleeping in small
//! increments until the frame budget is used up.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{PipelineError, Result};
use crate::lock::lock;

/// Delta time guessed for the first frame when no target frame rate is set.
const DEFAULT_FIRST_FRAME_FPS: f64 = 60.0;

/// Monotonic time source and sleep primitive.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Block the calling thread for roughly `duration`.
    fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic [`Clock`]: time only moves when advanced or slept on.
///
/// Clones share the same timeline.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    sleeps: usize,
}

impl ManualClock {
    /// Create a clock at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.state().now += duration;
    }

    /// Number of `sleep` calls observed so far.
    #[must_use]
    pub fn sleep_count(&self) -> usize {
        self.state().sleeps
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        lock(&self.inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.state().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state();
        state.now += duration;
        state.sleeps += 1;
    }
}

/// Delta times produced by [`FrameClock::begin`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTime {
    /// Delta time after applying the time scale.
    pub delta_time: f32,
    /// Delta time before scaling.
    pub delta_time_raw: f32,
}

/// Per-frame delta-time computation and frame pacing.
pub struct FrameClock {
    clock: Option<Arc<dyn Clock>>,
    frame_start: Option<Duration>,
    target_fps: f32,
    time_scale: f32,
    measure_frame_time: bool,
    world_time_total: f64,
    world_time_total_raw: f64,
    frame_time_total: f64,
}

impl std::fmt::Debug for FrameClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameClock")
            .field("has_clock", &self.clock.is_some())
            .field("frame_start", &self.frame_start)
            .field("target_fps", &self.target_fps)
            .field("time_scale", &self.time_scale)
            .field("measure_frame_time", &self.measure_frame_time)
            .finish_non_exhaustive()
    }
}

impl FrameClock {
    /// Create a frame clock over `clock`. `None` means no time source is
    /// available; frames then require an explicit delta time.
    #[must_use]
    pub fn new(clock: Option<Arc<dyn Clock>>) -> Self {
        Self {
            clock,
            frame_start: None,
            target_fps: 0.0,
            time_scale: 1.0,
            measure_frame_time: false,
            world_time_total: 0.0,
            world_time_total_raw: 0.0,
            frame_time_total: 0.0,
        }
    }

    /// Returns `true` if a time source is available.
    #[must_use]
    pub fn has_clock(&self) -> bool {
        self.clock.is_some()
    }

    /// Set the frame rate to pace to. Enables frame-time measurement.
    pub fn set_target_fps(&mut self, fps: f32) {
        self.target_fps = fps.max(0.0);
        self.measure_frame_time = true;
    }

    /// The configured target frame rate, `0.0` if unpaced.
    #[must_use]
    pub fn target_fps(&self) -> f32 {
        self.target_fps
    }

    /// Set the multiplier applied to every delta time.
    pub fn set_time_scale(&mut self, scale: f32) {
        self.time_scale = scale;
    }

    /// The current time scale.
    #[must_use]
    pub fn time_scale(&self) -> f32 {
        self.time_scale
    }

    /// Measure frame time even when the caller supplies a delta time.
    pub fn measure_frame_time(&mut self, enable: bool) {
        // A target frame rate needs measurement; it can't be switched off.
        if self.target_fps == 0.0 || enable {
            self.measure_frame_time = enable;
        }
    }

    /// Zero the accumulated world time.
    pub fn reset(&mut self) {
        self.world_time_total = 0.0;
        self.world_time_total_raw = 0.0;
    }

    /// Total scaled time passed in the world, in seconds.
    #[must_use]
    pub fn world_time_total(&self) -> f64 {
        self.world_time_total
    }

    /// Total measured time passed in the world, in seconds.
    #[must_use]
    pub fn world_time_total_raw(&self) -> f64 {
        self.world_time_total_raw
    }

    /// Total time spent between `begin` and `end`, in seconds.
    #[must_use]
    pub fn frame_time_total(&self) -> f64 {
        self.frame_time_total
    }

    /// Start a frame and compute its delta time.
    ///
    /// A `user_delta_time` of `0.0` means "measure it": the elapsed time since
    /// the previous frame is used, after pacing to the target frame rate.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingOsApi`] if the delta must be measured
    /// but no clock is available.
    pub fn begin(&mut self, user_delta_time: f32) -> Result<FrameTime> {
        let measure = self.measure_frame_time || user_delta_time == 0.0;
        let mut delta_time = 0.0;

        if measure {
            match self.clock.clone() {
                Some(clock) => delta_time = self.measure_start(clock.as_ref(), user_delta_time),
                None if user_delta_time == 0.0 => {
                    return Err(PipelineError::MissingOsApi("clock"));
                }
                None => {}
            }
        }

        let delta_time_raw = if user_delta_time == 0.0 {
            delta_time as f32
        } else {
            user_delta_time
        };
        let scaled = delta_time_raw * self.time_scale;
        self.world_time_total += f64::from(scaled);

        Ok(FrameTime {
            delta_time: scaled,
            delta_time_raw,
        })
    }

    /// Finish a frame, accumulating the time spent in it.
    pub fn end(&mut self) {
        if !self.measure_frame_time {
            return;
        }
        if let (Some(clock), Some(start)) = (&self.clock, self.frame_start) {
            self.frame_time_total += clock.now().saturating_sub(start).as_secs_f64();
        }
    }

    fn measure_start(&mut self, clock: &dyn Clock, user_delta_time: f32) -> f64 {
        let pace = self.target_fps > 0.0 && user_delta_time == 0.0;
        loop {
            let (now, delta_time) = match self.frame_start {
                Some(start) if pace => self.insert_sleep(clock, start),
                Some(start) => {
                    let now = clock.now();
                    (now, now.saturating_sub(start).as_secs_f64())
                }
                None => {
                    let guess = if self.target_fps > 0.0 {
                        1.0 / f64::from(self.target_fps)
                    } else {
                        1.0 / DEFAULT_FIRST_FRAME_FPS
                    };
                    (clock.now(), guess)
                }
            };

            // Keep trying while no time has passed.
            if delta_time > 0.0 {
                self.frame_start = Some(now);
                self.world_time_total_raw += delta_time;
                return delta_time;
            }
            std::hint::spin_loop();
        }
    }

    /// Sleep until the frame that started at `start` has used its budget.
    ///
    /// Sleeps in increments of a quarter of the remaining budget, measuring
    /// after each one, which keeps OS scheduler overshoot small.
    fn insert_sleep(&self, clock: &dyn Clock, start: Duration) -> (Duration, f64) {
        let target = 1.0 / f64::from(self.target_fps);
        let measured = clock.now().saturating_sub(start).as_secs_f64();
        let increment = (target - measured) / 4.0;

        loop {
            if increment > 0.0 {
                clock.sleep(Duration::from_secs_f64(increment));
            }
            let now = clock.now();
            let delta_time = now.saturating_sub(start).as_secs_f64();
            if target - delta_time <= increment / 2.0 {
                trace!(target, measured, delta_time, increment, "paced frame");
                return (now, delta_time);
            }
        }
    }
}
