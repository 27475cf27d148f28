//! World configuration.

use serde::Deserialize;

use crate::error::Result;

/// Runtime configuration applied when a [`World`](crate::World) is created.
///
/// All fields have defaults, so a partial JSON document is valid:
///
/// ```json
/// { "threads": 4, "target_fps": 60.0 }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Number of stages (main thread included). `0` and `1` both mean
    /// single-threaded.
    pub threads: usize,
    /// Frames per second `frame_begin` paces to. `0.0` disables pacing.
    pub target_fps: f32,
    /// Multiplier applied to every measured delta time.
    pub time_scale: f32,
    /// Measure frame time even when the caller supplies a delta.
    pub measure_frame_time: bool,
    /// Accumulate time spent inside systems.
    pub measure_system_time: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            target_fps: 0.0,
            time_scale: 1.0,
            measure_frame_time: false,
            measure_system_time: false,
        }
    }
}

impl WorldConfig {
    /// Parse a configuration from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`](crate::PipelineError::Config) if the
    /// document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Override the thread count.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Override the target frame rate.
    #[must_use]
    pub fn with_target_fps(mut self, fps: f32) -> Self {
        self.target_fps = fps;
        self
    }

    /// Override the time scale.
    #[must_use]
    pub fn with_time_scale(mut self, scale: f32) -> Self {
        self.time_scale = scale;
        self
    }
}
