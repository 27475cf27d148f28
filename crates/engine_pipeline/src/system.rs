//! Systems and the registry that owns them.
//!
//! A system is a query plus a callback. The query's terms tell the schedule
//! builder what the system reads and writes; the callback does the work. The
//! [`SystemRegistry`] is what a pipeline matches against: it orders systems
//! by phase and id, knows which systems are enabled and which are active, and
//! bumps a generation counter whenever any of that changes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use engine_term::{Entity, Id, QueryDesc};
use tracing::debug;

use crate::context::SystemContext;
use crate::error::{PipelineError, Result};
use crate::phase;
use crate::pipeline::PipelineQuery;
use crate::store::Storage;

/// A system callback.
pub type SystemFn<S> = Arc<dyn Fn(&mut SystemContext<'_, S>) + Send + Sync>;

/// Description of a system to register.
pub struct SystemDesc<S> {
    pub name: String,
    pub phase: Id,
    pub query: QueryDesc,
    pub tags: Vec<Id>,
    pub multi_threaded: bool,
    pub no_readonly: bool,
    pub callback: SystemFn<S>,
}

impl<S> SystemDesc<S> {
    /// A single-threaded, staged system in the `OnUpdate` phase with an empty
    /// query.
    pub fn new(
        name: impl Into<String>,
        callback: impl Fn(&mut SystemContext<'_, S>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            phase: phase::ON_UPDATE,
            query: QueryDesc::new(),
            tags: Vec::new(),
            multi_threaded: false,
            no_readonly: false,
            callback: Arc::new(callback),
        }
    }

    #[must_use]
    pub fn phase(mut self, phase: Id) -> Self {
        self.phase = phase;
        self
    }

    #[must_use]
    pub fn query(mut self, query: QueryDesc) -> Self {
        self.query = query;
        self
    }

    /// Tag the system. Pipeline queries match on tags.
    #[must_use]
    pub fn tag(mut self, tag: Id) -> Self {
        self.tags.push(tag);
        self
    }

    /// Run the system on every stage, each taking a slice of the work.
    #[must_use]
    pub fn multi_threaded(mut self, multi_threaded: bool) -> Self {
        self.multi_threaded = multi_threaded;
        self
    }

    /// Run the system against primary storage instead of a stage. Such a
    /// system always gets an op of its own, executed on the main thread.
    #[must_use]
    pub fn no_readonly(mut self, no_readonly: bool) -> Self {
        self.no_readonly = no_readonly;
        self
    }
}

impl<S> fmt::Debug for SystemDesc<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDesc")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("query", &self.query)
            .field("tags", &self.tags)
            .field("multi_threaded", &self.multi_threaded)
            .field("no_readonly", &self.no_readonly)
            .finish_non_exhaustive()
    }
}

/// A registered system.
pub struct SystemRecord<S> {
    pub id: Entity,
    pub name: String,
    pub phase: Id,
    pub query: QueryDesc,
    pub tags: Vec<Id>,
    pub multi_threaded: bool,
    pub no_readonly: bool,
    callback: SystemFn<S>,
    /// Frame marker (`frame_count_total + 1`) of the last frame the system
    /// ran in. Used to resume a schedule after a mid-frame rebuild.
    last_frame: AtomicU64,
}

impl<S> SystemRecord<S> {
    fn new(id: Entity, desc: SystemDesc<S>) -> Self {
        Self {
            id,
            name: desc.name,
            phase: desc.phase,
            query: desc.query,
            tags: desc.tags,
            multi_threaded: desc.multi_threaded,
            no_readonly: desc.no_readonly,
            callback: desc.callback,
            last_frame: AtomicU64::new(0),
        }
    }

    pub(crate) fn run(&self, ctx: &mut SystemContext<'_, S>) {
        (self.callback)(ctx);
    }

    #[must_use]
    pub fn last_frame(&self) -> u64 {
        self.last_frame.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ran(&self, frame_marker: u64) {
        self.last_frame.store(frame_marker, Ordering::Release);
    }
}

impl<S> fmt::Debug for SystemRecord<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("multi_threaded", &self.multi_threaded)
            .field("no_readonly", &self.no_readonly)
            .field("last_frame", &self.last_frame())
            .finish_non_exhaustive()
    }
}

/// Deferred change to the set of systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    Enable(Entity),
    Disable(Entity),
    Delete(Entity),
}

/// What the schedule builder needs to know about one system.
#[derive(Debug, Clone, Copy)]
pub struct SystemView<'a> {
    pub name: &'a str,
    pub query: &'a QueryDesc,
    pub multi_threaded: bool,
    pub no_readonly: bool,
    pub last_frame: u64,
}

/// Ordered source of systems for a pipeline.
pub trait SystemSource {
    /// Counter that changes whenever the result of `matched_systems` or
    /// `is_active` may have changed.
    fn match_generation(&self) -> u64;

    /// Enabled systems matching `query`, in run order.
    fn matched_systems(&self, query: &PipelineQuery) -> Vec<Entity>;

    fn system(&self, id: Entity) -> Option<SystemView<'_>>;

    /// An inactive system has nothing to iterate. It is skipped when running
    /// and its writes are ignored when placing merges.
    fn is_active(&self, id: Entity) -> bool;
}

struct SystemEntry<S> {
    record: Arc<SystemRecord<S>>,
    enabled: bool,
    active: bool,
}

/// Registered systems, keyed by id.
pub struct SystemRegistry<S> {
    systems: BTreeMap<Entity, SystemEntry<S>>,
    generation: u64,
    /// Storage generation activity was last computed for.
    activity_checked: Option<u64>,
}

impl<S> Default for SystemRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SystemRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            systems: BTreeMap::new(),
            generation: 0,
            activity_checked: None,
        }
    }

    /// Register a system under `id`. New systems start enabled and active.
    pub fn register(&mut self, id: Entity, desc: SystemDesc<S>) -> Arc<SystemRecord<S>> {
        let record = Arc::new(SystemRecord::new(id, desc));
        debug!(system = %record.name, id = id.0, "registered system");
        self.systems.insert(
            id,
            SystemEntry {
                record: Arc::clone(&record),
                enabled: true,
                active: true,
            },
        );
        self.generation += 1;
        self.activity_checked = None;
        record
    }

    /// Enable or disable a system.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `id` isn't a system.
    pub fn set_enabled(&mut self, id: Entity, enabled: bool) -> Result<()> {
        let entry = self
            .systems
            .get_mut(&id)
            .ok_or_else(|| PipelineError::InvalidParameter(format!("{id} is not a system")))?;
        if entry.enabled != enabled {
            entry.enabled = enabled;
            self.generation += 1;
        }
        Ok(())
    }

    /// Remove a system.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if `id` isn't a system.
    pub fn remove(&mut self, id: Entity) -> Result<()> {
        let entry = self
            .systems
            .remove(&id)
            .ok_or_else(|| PipelineError::InvalidParameter(format!("{id} is not a system")))?;
        debug!(system = %entry.record.name, id = id.0, "deleted system");
        self.generation += 1;
        Ok(())
    }

    /// Apply a deferred system command.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the target isn't a
    /// system.
    pub fn apply(&mut self, command: SystemCommand) -> Result<()> {
        match command {
            SystemCommand::Enable(id) => self.set_enabled(id, true),
            SystemCommand::Disable(id) => self.set_enabled(id, false),
            SystemCommand::Delete(id) => self.remove(id),
        }
    }

    #[must_use]
    pub fn get(&self, id: Entity) -> Option<Arc<SystemRecord<S>>> {
        self.systems.get(&id).map(|entry| Arc::clone(&entry.record))
    }

    #[must_use]
    pub fn is_enabled(&self, id: Entity) -> bool {
        self.systems.get(&id).is_some_and(|entry| entry.enabled)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Ids of the enabled systems in `phase`.
    pub fn systems_in_phase(&self, phase: Id) -> impl Iterator<Item = Entity> + '_ {
        self.systems
            .values()
            .filter(move |entry| entry.enabled && entry.record.phase == phase)
            .map(|entry| entry.record.id)
    }

    /// Recompute which systems are active. A system whose query has no
    /// `This` terms is always active; otherwise it needs at least one
    /// matching entity. Skipped while the storage structure is unchanged.
    pub fn refresh_activity(&mut self, store: &S)
    where
        S: Storage,
    {
        let structure = store.structure_generation();
        if self.activity_checked == Some(structure) {
            return;
        }
        self.activity_checked = Some(structure);

        let mut changed = false;
        for entry in self.systems.values_mut() {
            let query = &entry.record.query;
            let active = !query.has_this_terms() || store.has_matches(query);
            if entry.active != active {
                entry.active = active;
                changed = true;
            }
        }
        if changed {
            self.generation += 1;
        }
    }
}

impl<S> SystemSource for SystemRegistry<S> {
    fn match_generation(&self) -> u64 {
        self.generation
    }

    fn matched_systems(&self, query: &PipelineQuery) -> Vec<Entity> {
        let mut matched: Vec<(usize, Entity)> = self
            .systems
            .values()
            .filter(|entry| entry.enabled)
            .filter_map(|entry| {
                let record = &entry.record;
                let position = query.phases.iter().position(|p| *p == record.phase)?;
                let tagged = query
                    .query
                    .matches_entity(|id| record.tags.iter().any(|tag| tag.matches(id)));
                tagged.then_some((position, record.id))
            })
            .collect();
        matched.sort_unstable();
        matched.into_iter().map(|(_, id)| id).collect()
    }

    fn system(&self, id: Entity) -> Option<SystemView<'_>> {
        self.systems.get(&id).map(|entry| SystemView {
            name: &entry.record.name,
            query: &entry.record.query,
            multi_threaded: entry.record.multi_threaded,
            no_readonly: entry.record.no_readonly,
            last_frame: entry.record.last_frame(),
        })
    }

    fn is_active(&self, id: Entity) -> bool {
        self.systems.get(&id).is_some_and(|entry| entry.active)
    }
}

impl<S> fmt::Debug for SystemRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemRegistry")
            .field("systems", &self.systems.len())
            .field("generation", &self.generation)
            .finish()
    }
}
