//! # engine_pipeline
//!
//! Frame pipeline scheduler. Decides the order systems run in each frame,
//! inserts merges wherever a system could observe (or clobber) writes still
//! queued by an earlier one, and drives one or more threads through the
//! resulting schedule.
//!
//! This crate provides:
//!
//! - [`World`]: frames, pipelines, systems, and thread management.
//! - [`FrameClock`]: delta-time measurement and frame pacing.
//! - [`PipelineState`]: schedule building and resumption after rebuilds.
//! - [`WriteState`]: the write tracker used to place merges.
//! - [`ComponentStore`]: a concurrent `serde_json::Value` component store.
//!
//! ```no_run
//! use engine_pipeline::{SystemDesc, World};
//!
//! let mut world = World::empty();
//! world.register_system(SystemDesc::new("hello", |ctx| {
//!     println!("frame {} dt {}", ctx.frame(), ctx.delta_time());
//! }));
//! world.progress(1.0 / 60.0).unwrap();
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod info;
pub mod phase;
pub mod pipeline;
pub mod stage;
pub mod store;
pub mod system;
pub mod world;
pub mod write_state;

mod lock;
mod worker;

pub use clock::{Clock, FrameClock, FrameTime, ManualClock, SystemClock};
pub use config::WorldConfig;
pub use context::SystemContext;
pub use cursor::Cursor;
pub use error::{PipelineError, Result};
pub use info::WorldInfo;
pub use pipeline::{PipelineDesc, PipelineOp, PipelineQuery, PipelineState, Schedule};
pub use stage::{Command, CommandEvent, CommandKind, CommandObserver, Stage};
pub use store::{ComponentStore, Storage};
pub use system::{SystemCommand, SystemDesc, SystemRecord, SystemRegistry, SystemSource, SystemView};
pub use world::World;
pub use write_state::{WriteKind, WriteState};
