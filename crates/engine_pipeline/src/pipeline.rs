//! Schedule building.
//!
//! A pipeline turns an ordered list of systems into a list of ops. An op is
//! a run of systems that can execute back to back without a merge in
//! between; consecutive ops are separated by a merge, where every stage's
//! queued commands are applied to primary storage.
//!
//! ## Merge placement
//!
//! The builder walks systems in run order, keeping a [`WriteState`] of ids
//! that may have been written to a stage since the last merge. A system
//! needs a merge before it when:
//!
//! - one of its `This` terms refers to an id with a pending stage write, or
//! - one of its sourceless terms reads an id with a pending stage write, or
//! - its `(multi_threaded, no_readonly)` flags differ from the op's, or
//! - the op is `no_readonly`, which gives each such system an op of its own.
//!
//! Sourceless writes (and `Not` terms marked `Out`, which announce adding a
//! component the entity doesn't have yet) of active systems are recorded.
//! Writes to owned `This` terms are not: they happen in place, on data other
//! systems in the same op can already see.
//!
//! ## Resuming
//!
//! A merge may change which systems match (a system enabled or deleted by a
//! command), so the schedule can be rebuilt mid-frame. Each system records
//! the frame it last ran in; after a rebuild the cursor is moved to the last
//! system that ran in the current frame and execution resumes after it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use engine_term::{Entity, Id, InOutKind, Oper, QueryDesc, Term};
use serde::Serialize;
use tracing::debug;

use crate::cursor::Cursor;
use crate::phase;
use crate::system::SystemSource;
use crate::write_state::{WriteKind, WriteState};

/// Description of a pipeline to create.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub name: String,
    /// Phases to run, in order.
    pub phases: Vec<Id>,
    /// Tag query systems must satisfy.
    pub query: QueryDesc,
}

impl PipelineDesc {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
            query: QueryDesc::new(),
        }
    }

    /// The pipeline every world starts with.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new("BuiltinPipeline").phases(phase::BUILTIN_PHASES)
    }

    pub(crate) fn startup() -> Self {
        Self::new("StartupPipeline").phase(phase::ON_START)
    }

    #[must_use]
    pub fn phase(mut self, phase: Id) -> Self {
        self.phases.push(phase);
        self
    }

    #[must_use]
    pub fn phases(mut self, phases: impl IntoIterator<Item = Id>) -> Self {
        self.phases.extend(phases);
        self
    }

    #[must_use]
    pub fn query(mut self, query: QueryDesc) -> Self {
        self.query = query;
        self
    }
}

/// What a pipeline matches: systems in one of `phases` whose tags satisfy
/// `query`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineQuery {
    pub phases: Vec<Id>,
    pub query: QueryDesc,
}

impl PipelineQuery {
    #[must_use]
    pub fn new(phases: Vec<Id>, query: QueryDesc) -> Self {
        Self { phases, query }
    }
}

/// A run of systems between two merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineOp {
    /// Index of the first system in the flattened system list.
    pub offset: usize,
    pub count: usize,
    pub multi_threaded: bool,
    pub no_readonly: bool,
    /// Commands merged after this op since the schedule was built.
    pub commands_enqueued: u64,
    /// Time spent in those merges. Only measured with system time.
    pub time_spent: Duration,
}

impl PipelineOp {
    /// One past the last system of the op.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.count
    }
}

/// Snapshot of a built schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub ops: Vec<PipelineOp>,
    pub systems: Vec<Entity>,
    pub rebuild_count: u64,
}

/// A pipeline's schedule and its position in it.
///
/// Once any system matches, the schedule has at least one op: if none of
/// the matched systems is active it holds a single op with no members.
/// Running that op does nothing but toggle readonly mode.
#[derive(Debug)]
pub struct PipelineState {
    name: String,
    query: PipelineQuery,
    ops: Vec<PipelineOp>,
    systems: Vec<Entity>,
    cursor: Cursor,
    /// Match generation the schedule was built for. `None` until the first
    /// build.
    match_count: Option<u64>,
    rebuild_count: u64,
    stage_runs: Vec<AtomicUsize>,
}

impl PipelineState {
    #[must_use]
    pub fn new(name: impl Into<String>, query: PipelineQuery) -> Self {
        Self {
            name: name.into(),
            query,
            ops: Vec::new(),
            systems: Vec::new(),
            cursor: Cursor::NotStarted,
            match_count: None,
            rebuild_count: 0,
            stage_runs: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ops(&self) -> &[PipelineOp] {
        &self.ops
    }

    #[must_use]
    pub fn systems(&self) -> &[Entity] {
        &self.systems
    }

    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    /// The op under the cursor.
    #[must_use]
    pub fn current_op(&self) -> Option<&PipelineOp> {
        self.cursor.op().map(|op| &self.ops[op])
    }

    #[must_use]
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    #[must_use]
    pub fn match_count(&self) -> Option<u64> {
        self.match_count
    }

    /// Systems each stage ran since the start of the frame.
    #[must_use]
    pub fn stage_runs(&self) -> Vec<usize> {
        self.stage_runs
            .iter()
            .map(|runs| runs.load(Ordering::Relaxed))
            .collect()
    }

    /// Charge the merge that closed the op under the cursor.
    pub(crate) fn record_merge(&mut self, commands: usize, spent: Duration) {
        if let Some(op) = self.cursor.op().and_then(|op| self.ops.get_mut(op)) {
            op.commands_enqueued += u64::try_from(commands).unwrap_or(u64::MAX);
            op.time_spent += spent;
        }
    }

    pub(crate) fn record_run(&self, stage_index: usize) {
        if let Some(runs) = self.stage_runs.get(stage_index) {
            runs.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn schedule(&self) -> Schedule {
        Schedule {
            ops: self.ops.clone(),
            systems: self.systems.clone(),
            rebuild_count: self.rebuild_count,
        }
    }

    /// Rebuild the schedule if the match generation changed. Returns `true`
    /// if it was rebuilt.
    ///
    /// `frame_count_total` is the number of completed frames; systems that
    /// ran in the frame in progress carry `frame_count_total + 1` as their
    /// marker.
    pub fn build(&mut self, source: &impl SystemSource, frame_count_total: u64) -> bool {
        let generation = source.match_generation();
        if self.match_count == Some(generation) {
            return false;
        }

        self.rebuild_count += 1;
        self.ops.clear();
        self.systems.clear();

        let mut ws = WriteState::new();
        let mut open: Option<usize> = None;
        let mut multi_threaded = false;
        let mut no_readonly = false;
        let mut first = true;

        for id in source.matched_systems(&self.query) {
            let Some(system) = source.system(id) else {
                continue;
            };
            let is_active = source.is_active(id);
            let mut needs_merge = check_terms(system.query, is_active, &mut ws);

            if is_active {
                if first {
                    multi_threaded = system.multi_threaded;
                    no_readonly = system.no_readonly;
                    first = false;
                }
                if system.multi_threaded != multi_threaded {
                    needs_merge = true;
                    multi_threaded = system.multi_threaded;
                }
                if system.no_readonly != no_readonly {
                    needs_merge = true;
                    no_readonly = system.no_readonly;
                }
            }

            if no_readonly {
                needs_merge = true;
            }

            if needs_merge {
                ws.reset();

                // An inactive system can request a merge and then not join
                // the op. Reuse the op if it's still empty.
                if open.is_some_and(|op| self.ops[op].count > 0) {
                    open = None;
                }

                // Reseed the tracker with this system's own writes.
                if is_active {
                    let again = check_terms(system.query, true, &mut ws);
                    assert!(!again, "merge requested right after a merge");
                }
            }

            let op = match open {
                Some(op) => op,
                None => {
                    self.ops.push(PipelineOp {
                        offset: self.systems.len(),
                        count: 0,
                        multi_threaded: false,
                        no_readonly: false,
                        commands_enqueued: 0,
                        time_spent: Duration::ZERO,
                    });
                    let op = self.ops.len() - 1;
                    open = Some(op);
                    op
                }
            };

            // Inactive systems don't run, so they don't occupy a slot.
            if is_active {
                self.systems.push(id);
                let op = &mut self.ops[op];
                if op.count == 0 {
                    op.multi_threaded = multi_threaded;
                    op.no_readonly = no_readonly;
                }
                op.count += 1;
            }
        }

        if self.ops.last().is_some_and(|op| op.count == 0) && self.ops.len() > 1 {
            self.ops.pop();
        }

        self.cursor = self.relocate(source, frame_count_total + 1);
        self.match_count = Some(generation);
        self.log_schedule(source);
        true
    }

    /// Rebuild if stale, then position the cursor: at the first system on
    /// the start of a frame, past the last system that ran otherwise.
    pub fn update(
        &mut self,
        source: &impl SystemSource,
        frame_count_total: u64,
        start_of_frame: bool,
        stage_count: usize,
    ) -> bool {
        let rebuilt = self.build(source, frame_count_total);
        if start_of_frame {
            self.stage_runs = (0..stage_count).map(|_| AtomicUsize::new(0)).collect();
            self.cursor = Cursor::start(&self.ops);
        } else {
            self.cursor.next_system(&self.ops);
        }
        rebuilt
    }

    /// Find the last system that ran in the frame marked `frame_marker`.
    fn relocate(&self, source: &impl SystemSource, frame_marker: u64) -> Cursor {
        let mut cursor = Cursor::NotStarted;
        let mut op = 0;
        let mut ran_since_merge = 0;
        for (index, id) in self.systems.iter().enumerate() {
            debug_assert_eq!(self.ops[op].offset + ran_since_merge, index);
            ran_since_merge += 1;
            if ran_since_merge == self.ops[op].count {
                ran_since_merge = 0;
                op += 1;
            }

            let ran = source
                .system(*id)
                .is_some_and(|system| system.last_frame == frame_marker);
            if ran {
                cursor = if op < self.ops.len() {
                    Cursor::At { op, index }
                } else {
                    Cursor::Finished
                };
            }
        }
        cursor
    }

    fn log_schedule(&self, source: &impl SystemSource) {
        if self.ops.is_empty() {
            debug!(pipeline = %self.name, rebuild = self.rebuild_count, "pipeline is empty");
            return;
        }
        debug!(
            pipeline = %self.name,
            rebuild = self.rebuild_count,
            ops = self.ops.len(),
            systems = self.systems.len(),
            "pipeline rebuild"
        );
        for (i, op) in self.ops.iter().enumerate() {
            let names: Vec<&str> = self.systems[op.offset..op.end()]
                .iter()
                .filter_map(|id| source.system(*id).map(|s| s.name))
                .collect();
            debug!(
                pipeline = %self.name,
                op = i,
                threading = op.multi_threaded,
                staging = !op.no_readonly,
                systems = ?names,
                "schedule"
            );
        }
    }
}

/// Check every term of a system, `This` terms first. Writes from every term
/// are recorded even once a merge is known to be needed.
fn check_terms(query: &QueryDesc, is_active: bool, ws: &mut WriteState) -> bool {
    let mut needs_merge = false;
    for term in query.terms.iter().filter(|t| t.matches_this()) {
        needs_merge |= check_term(term, is_active, ws);
    }
    for term in query.terms.iter().filter(|t| !t.matches_this()) {
        needs_merge |= check_term(term, is_active, ws);
    }
    needs_merge
}

fn check_term(term: &Term, is_active: bool, ws: &mut WriteState) -> bool {
    if matches!(term.inout, InOutKind::None | InOutKind::Filter) {
        return false;
    }

    let mut from_any = term.matches_nothing();
    let from_this = term.matches_this();
    let pending = ws.get(term.id) == WriteKind::ToStage;

    // Even a pure write to primary storage must not be overwritten by an
    // earlier staged write that gets merged later.
    if from_this && pending {
        return true;
    }

    let inout = match term.inout {
        // A sourceless id without an access annotation is just a parameter.
        InOutKind::Default if from_any => return false,
        InOutKind::Default if term.is_shared() => InOutKind::In,
        InOutKind::Default => InOutKind::InOut,
        inout => inout,
    };

    if term.oper == Oper::Not && inout == InOutKind::Out {
        from_any = true;
    }

    if !from_any {
        return false;
    }

    if matches!(inout, InOutKind::Out | InOutKind::InOut) && is_active {
        ws.set(term.id);
    }

    matches!(inout, InOutKind::In | InOutKind::InOut) && pending
}

#[cfg(test)]
mod tests {
    use engine_term::{Source, Traversal};

    use super::*;
    use crate::system::SystemView;

    struct FakeSystem {
        id: Entity,
        name: String,
        query: QueryDesc,
        multi_threaded: bool,
        no_readonly: bool,
        active: bool,
        last_frame: u64,
    }

    #[derive(Default)]
    struct FakeSource {
        systems: Vec<FakeSystem>,
        generation: u64,
    }

    impl FakeSource {
        fn add(&mut self, name: &str, query: QueryDesc) -> &mut FakeSystem {
            self.generation += 1;
            let id = Entity(self.systems.len() as u64 + 1);
            self.systems.push(FakeSystem {
                id,
                name: name.to_string(),
                query,
                multi_threaded: false,
                no_readonly: false,
                active: true,
                last_frame: 0,
            });
            self.systems.last_mut().unwrap()
        }

        fn get(&self, id: Entity) -> Option<&FakeSystem> {
            self.systems.iter().find(|s| s.id == id)
        }
    }

    impl SystemSource for FakeSource {
        fn match_generation(&self) -> u64 {
            self.generation
        }

        fn matched_systems(&self, _query: &PipelineQuery) -> Vec<Entity> {
            self.systems.iter().map(|s| s.id).collect()
        }

        fn system(&self, id: Entity) -> Option<SystemView<'_>> {
            self.get(id).map(|s| SystemView {
                name: &s.name,
                query: &s.query,
                multi_threaded: s.multi_threaded,
                no_readonly: s.no_readonly,
                last_frame: s.last_frame,
            })
        }

        fn is_active(&self, id: Entity) -> bool {
            self.get(id).is_some_and(|s| s.active)
        }
    }

    fn state() -> PipelineState {
        PipelineState::new(
            "test",
            PipelineQuery::new(phase::BUILTIN_PHASES.to_vec(), QueryDesc::new()),
        )
    }

    fn counts(state: &PipelineState) -> Vec<usize> {
        state.ops().iter().map(|op| op.count).collect()
    }

    fn position() -> Id {
        Id::from_name("Position")
    }

    #[test]
    fn test_owned_write_then_read_needs_no_merge() {
        let mut source = FakeSource::default();
        source.add("s1", QueryDesc::new().write(position()));
        source.add("s2", QueryDesc::new().read(position()));

        let mut state = state();
        assert!(state.build(&source, 0));
        assert_eq!(counts(&state), vec![2]);
    }

    #[test]
    fn test_staged_write_then_owned_read_merges() {
        let mut source = FakeSource::default();
        source.add("s1", QueryDesc::new().writes_to(position()));
        source.add("s2", QueryDesc::new().read(position()));

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1, 1]);
        assert_eq!(state.systems(), &[Entity(1), Entity(2)]);
    }

    #[test]
    fn test_staged_write_then_staged_read_merges() {
        let mut source = FakeSource::default();
        source.add("s1", QueryDesc::new().writes_to(position()));
        source.add("s2", QueryDesc::new().reads_from(position()));

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1, 1]);
    }

    #[test]
    fn test_staged_write_then_unrelated_read() {
        let mut source = FakeSource::default();
        source.add("s1", QueryDesc::new().writes_to(position()));
        source.add("s2", QueryDesc::new().read(Id::from_name("Velocity")));
        source.add("s3", QueryDesc::new().filter(position()));

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![3], "filter terms don't observe data");
    }

    #[test]
    fn test_default_sourceless_term_is_a_parameter() {
        let mut source = FakeSource::default();
        source.add("s1", QueryDesc::new().writes_to(position()));
        source.add(
            "s2",
            QueryDesc::new().term(Term::new(position()).src(Source::Nothing)),
        );

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![2]);
    }

    #[test]
    fn test_not_out_counts_as_staged_write() {
        let marker = Id::from_name("Marker");
        let mut source = FakeSource::default();
        source.add("tagger", QueryDesc::new().with(position()).adds(marker));
        source.add("reader", QueryDesc::new().read(marker));

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1, 1]);
    }

    #[test]
    fn test_up_traversal_sees_staged_write() {
        let gravity = Id::from_name("Gravity");
        let mut source = FakeSource::default();
        source.add("s1", QueryDesc::new().writes_to(gravity));
        source.add(
            "s2",
            QueryDesc::new().term(Term::new(gravity).src(Source::This(Traversal::UP))),
        );

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1, 1]);
    }

    #[test]
    fn test_wildcard_write_is_a_barrier() {
        let mut source = FakeSource::default();
        source.add("s1", QueryDesc::new().writes_to(Id::WILDCARD));
        source.add("s2", QueryDesc::new().read(Id::from_name("Anything")));

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1, 1]);
    }

    #[test]
    fn test_inactive_writer_records_nothing() {
        let mut source = FakeSource::default();
        source.add("s1", QueryDesc::new().writes_to(position())).active = false;
        source.add("s2", QueryDesc::new().read(position()));

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1]);
        assert_eq!(state.systems(), &[Entity(2)]);
    }

    #[test]
    fn test_inactive_merger_reuses_empty_op() {
        let mut source = FakeSource::default();
        source.add("writer", QueryDesc::new().writes_to(position()));
        source.add("idle", QueryDesc::new().read(position())).active = false;
        source.add("threaded", QueryDesc::new()).multi_threaded = true;

        let mut state = state();
        state.build(&source, 0);
        // `idle` closes the writer's op and opens an empty one it doesn't
        // join. `threaded` changes flags, so it asks for a merge as well and
        // must take over that empty op instead of opening a third.
        assert_eq!(counts(&state), vec![1, 1]);
        assert!(state.ops().iter().all(|op| op.count > 0));
        assert_eq!(state.ops()[1].offset, 1);
        let threaded: Vec<bool> = state.ops().iter().map(|op| op.multi_threaded).collect();
        assert_eq!(threaded, vec![false, true]);
        assert_eq!(state.systems(), &[Entity(1), Entity(3)]);
    }

    #[test]
    fn test_inactive_trailing_merger_leaves_no_empty_op() {
        let mut source = FakeSource::default();
        source.add("writer", QueryDesc::new().writes_to(position()));
        source.add("idle_tail", QueryDesc::new().read(position())).active = false;

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1]);
    }

    #[test]
    fn test_this_terms_are_checked_first() {
        // Declared write-then-read, the read of the system's own staged write
        // would ask for a merge against itself.
        let mut source = FakeSource::default();
        source.add("self", QueryDesc::new().writes_to(position()).read(position()));

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1]);

        source.add("next", QueryDesc::new().read(position()));
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1, 1], "the write is still recorded");
    }

    #[test]
    fn test_threading_change_splits_ops() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new());
        source.add("b", QueryDesc::new()).multi_threaded = true;
        source.add("c", QueryDesc::new()).multi_threaded = true;
        source.add("d", QueryDesc::new());

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1, 2, 1]);
        let threaded: Vec<bool> = state.ops().iter().map(|op| op.multi_threaded).collect();
        assert_eq!(threaded, vec![false, true, false]);
    }

    #[test]
    fn test_no_readonly_systems_get_their_own_op() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new());
        source.add("b", QueryDesc::new()).no_readonly = true;
        source.add("c", QueryDesc::new()).no_readonly = true;
        source.add("d", QueryDesc::new());
        source.add("e", QueryDesc::new());

        let mut state = state();
        state.build(&source, 0);
        assert_eq!(counts(&state), vec![1, 1, 1, 2]);
        let immediate: Vec<bool> = state.ops().iter().map(|op| op.no_readonly).collect();
        assert_eq!(immediate, vec![false, true, true, false]);
    }

    #[test]
    fn test_build_is_idempotent() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new().writes_to(position()));
        source.add("b", QueryDesc::new().read(position()));

        let mut state = state();
        assert!(state.build(&source, 0));
        let before = state.schedule();
        assert!(!state.build(&source, 0));
        assert_eq!(state.schedule(), before);
        assert_eq!(state.rebuild_count(), 1);

        source.add("c", QueryDesc::new());
        assert!(state.build(&source, 0));
        assert_eq!(state.rebuild_count(), 2);
    }

    #[test]
    fn test_empty_pipeline() {
        let source = FakeSource::default();
        let mut state = state();
        state.update(&source, 0, true, 1);
        assert!(state.ops().is_empty());
        assert_eq!(state.cursor(), Cursor::Finished);
        assert_eq!(state.current_op(), None);
    }

    #[test]
    fn test_all_inactive_pipeline_keeps_one_empty_op() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new().writes_to(position())).active = false;
        source.add("b", QueryDesc::new().read(position())).active = false;
        let mut state = state();
        state.update(&source, 0, true, 1);
        assert_eq!(counts(&state), vec![0]);
        assert!(state.systems().is_empty());
        assert_eq!(state.cursor(), Cursor::At { op: 0, index: 0 });

        state.update(&source, 0, false, 1);
        assert_eq!(state.cursor(), Cursor::Finished);
    }

    #[test]
    fn test_merges_are_charged_to_their_op() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new().writes_to(position()));
        source.add("b", QueryDesc::new().read(position()));

        let mut state = state();
        for _ in 0..2 {
            state.update(&source, 0, true, 1);
            state.record_merge(3, Duration::from_millis(2));
            state.update(&source, 0, false, 1);
            state.record_merge(1, Duration::from_millis(1));
        }
        let stats: Vec<(u64, Duration)> = state
            .ops()
            .iter()
            .map(|op| (op.commands_enqueued, op.time_spent))
            .collect();
        assert_eq!(
            stats,
            vec![(6, Duration::from_millis(4)), (2, Duration::from_millis(2))]
        );

        // A finished cursor charges nothing.
        state.update(&source, 0, false, 1);
        state.record_merge(5, Duration::from_millis(5));
        assert_eq!(state.ops()[1].commands_enqueued, 2);

        // A rebuild starts the stats over.
        source.add("c", QueryDesc::new());
        state.build(&source, 0);
        assert!(state.ops().iter().all(|op| op.commands_enqueued == 0));
    }

    #[test]
    fn test_rebuild_relocates_cursor_after_last_ran() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new().writes_to(position())).last_frame = 5;
        source.add("b", QueryDesc::new().read(position())).last_frame = 5;
        source.add("c", QueryDesc::new().writes_to(position()));
        source.add("d", QueryDesc::new().read(position()));

        // Frame 5 is in progress (4 completed); `a` and `b` ran in it.
        let mut state = state();
        state.update(&source, 4, false, 1);
        assert_eq!(counts(&state), vec![1, 2, 1]);
        assert_eq!(state.cursor(), Cursor::At { op: 1, index: 2 });
    }

    #[test]
    fn test_rebuild_relocates_across_op_boundary() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new().writes_to(position())).last_frame = 5;
        source.add("b", QueryDesc::new().read(position()));

        let mut state = state();
        state.build(&source, 4);
        assert_eq!(state.cursor(), Cursor::At { op: 1, index: 0 });
        state.update(&source, 4, false, 1);
        assert_eq!(state.cursor(), Cursor::At { op: 1, index: 1 });
    }

    #[test]
    fn test_rebuild_after_last_system_finishes() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new()).last_frame = 5;

        let mut state = state();
        state.build(&source, 4);
        assert_eq!(state.cursor(), Cursor::Finished);
    }

    #[test]
    fn test_start_of_frame_resets_cursor_and_stage_runs() {
        let mut source = FakeSource::default();
        source.add("a", QueryDesc::new()).last_frame = 1;

        let mut state = state();
        state.update(&source, 0, true, 3);
        assert_eq!(state.cursor(), Cursor::At { op: 0, index: 0 });
        state.record_run(2);
        assert_eq!(state.stage_runs(), vec![0, 0, 1]);
    }
}
