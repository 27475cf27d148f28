//! Per-run execution context provided to system callbacks.

use std::ops::Range;
use std::sync::atomic::Ordering;

use engine_term::Entity;

use crate::error::Result;
use crate::lock::write;
use crate::stage::{Command, Stage};
use crate::system::SystemCommand;
use crate::world::Shared;

/// Context handed to a system each time it runs.
///
/// In a multi-threaded op every stage runs the system once; use
/// [`partition`](Self::partition) to split the work. While the context is
/// *staged* (the usual case), mutations go through [`defer`](Self::defer)
/// and become visible after the next merge. A `no_readonly` system runs
/// unstaged and its deferred commands apply immediately.
pub struct SystemContext<'a, S> {
    system: Entity,
    name: &'a str,
    delta_time: f32,
    stage_index: usize,
    stage_count: usize,
    frame: u64,
    staged: bool,
    shared: &'a Shared<S>,
    stage: &'a Stage<S>,
}

impl<'a, S> SystemContext<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        system: Entity,
        name: &'a str,
        delta_time: f32,
        stage_index: usize,
        stage_count: usize,
        frame: u64,
        staged: bool,
        shared: &'a Shared<S>,
        stage: &'a Stage<S>,
    ) -> Self {
        Self {
            system,
            name,
            delta_time,
            stage_index,
            stage_count,
            frame,
            staged,
            shared,
            stage,
        }
    }

    /// The running system.
    #[must_use]
    pub fn system(&self) -> Entity {
        self.system
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Scaled delta time of the frame, in seconds.
    #[must_use]
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    #[must_use]
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stage_count
    }

    /// Number of frames completed before this one.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Returns `true` if mutations are queued until the next merge.
    #[must_use]
    pub fn is_staged(&self) -> bool {
        self.staged
    }

    /// Primary storage. Reads observe the state as of the last merge.
    ///
    /// Components the system's `This` terms write may be updated in place on
    /// the entities the system iterates. Structural changes, and writes to
    /// anything else, go through [`defer`](Self::defer).
    #[must_use]
    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// Mutate primary storage: queued on this stage when staged, applied
    /// right away otherwise.
    pub fn defer(&self, f: impl FnOnce(&S) + Send + 'static) {
        if self.staged {
            self.stage.push(Command::Store(Box::new(f)));
        } else {
            f(&self.shared.store);
        }
    }

    /// Enable a system.
    ///
    /// # Errors
    ///
    /// When unstaged, returns [`PipelineError::InvalidParameter`](crate::PipelineError::InvalidParameter)
    /// if `id` isn't a system. Staged commands report failures as warnings
    /// when merged.
    pub fn enable_system(&self, id: Entity) -> Result<()> {
        self.system_command(SystemCommand::Enable(id))
    }

    /// Disable a system. See [`enable_system`](Self::enable_system).
    ///
    /// # Errors
    ///
    /// Same as [`enable_system`](Self::enable_system).
    pub fn disable_system(&self, id: Entity) -> Result<()> {
        self.system_command(SystemCommand::Disable(id))
    }

    /// Delete a system. See [`enable_system`](Self::enable_system).
    ///
    /// # Errors
    ///
    /// Same as [`enable_system`](Self::enable_system).
    pub fn delete_system(&self, id: Entity) -> Result<()> {
        self.system_command(SystemCommand::Delete(id))
    }

    /// Ask the application to stop after this frame.
    pub fn quit(&self) {
        self.shared.flags.quit.store(true, Ordering::Release);
    }

    /// The slice of `0..len` this stage is responsible for. Slices of all
    /// stages are disjoint and cover the whole range.
    #[must_use]
    pub fn partition(&self, len: usize) -> Range<usize> {
        let count = self.stage_count.max(1);
        let chunk = len / count;
        let rest = len % count;
        let index = self.stage_index;
        let start = index * chunk + index.min(rest);
        let end = start + chunk + usize::from(index < rest);
        start..end
    }

    fn system_command(&self, command: SystemCommand) -> Result<()> {
        if self.staged {
            self.stage.push(Command::System(command));
            Ok(())
        } else {
            write(&self.shared.registry).apply(command)
        }
    }
}
