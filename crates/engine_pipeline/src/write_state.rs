//! Build-time tracking of writes that may still sit in a stage queue.
//!
//! While a schedule is built, every sourceless write of an active system is
//! recorded here. A later system that reads the same id (or touches it on
//! its matched entities) must wait for a merge, after which the tracker is
//! reset.

use std::collections::HashSet;

use engine_term::Id;

/// Whether an id may have an unflushed write in some stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteKind {
    /// No pending write is known.
    None,
    /// A write may be queued in a stage and not yet merged.
    ToStage,
}

/// Ids written since the last merge.
#[derive(Debug, Default)]
pub struct WriteState {
    ids: HashSet<Id>,
    wildcard_ids: HashSet<Id>,
    write_barrier: bool,
}

impl WriteState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the write state of `id`.
    ///
    /// Querying the wildcard itself is a read barrier: it reports a
    /// pending write if anything at all was written.
    #[must_use]
    pub fn get(&self, id: Id) -> WriteKind {
        if self.write_barrier {
            return WriteKind::ToStage;
        }

        if id == Id::WILDCARD && !(self.ids.is_empty() && self.wildcard_ids.is_empty()) {
            return WriteKind::ToStage;
        }

        let direct = if id.is_wildcard() {
            self.ids.iter().any(|written| written.matches(id))
        } else {
            self.ids.contains(&id)
        };
        if direct {
            return WriteKind::ToStage;
        }

        if self.wildcard_ids.iter().any(|pattern| id.matches(*pattern)) {
            return WriteKind::ToStage;
        }

        WriteKind::None
    }

    /// Record a write to `id`. Writing the wildcard marks every id dirty.
    pub fn set(&mut self, id: Id) {
        if id == Id::WILDCARD {
            self.write_barrier = true;
        } else if id.is_wildcard() {
            self.wildcard_ids.insert(id);
        } else {
            self.ids.insert(id);
        }
    }

    /// Forget every recorded write. Called after a merge is inserted.
    pub fn reset(&mut self) {
        self.ids.clear();
        self.wildcard_ids.clear();
        self.write_barrier = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Id, Id, Id, Id) {
        (
            Id::from_name("Position"),
            Id::from_name("Likes"),
            Id::from_name("Apples"),
            Id::from_name("Pears"),
        )
    }

    #[test]
    fn test_empty_state_reports_nothing() {
        let (position, ..) = ids();
        let ws = WriteState::new();
        assert_eq!(ws.get(position), WriteKind::None);
        assert_eq!(ws.get(Id::WILDCARD), WriteKind::None);
    }

    #[test]
    fn test_concrete_write() {
        let (position, likes, ..) = ids();
        let mut ws = WriteState::new();
        ws.set(position);
        assert_eq!(ws.get(position), WriteKind::ToStage);
        assert_eq!(ws.get(likes), WriteKind::None);
    }

    #[test]
    fn test_wildcard_lookup_sees_any_write() {
        let (position, ..) = ids();
        let mut ws = WriteState::new();
        ws.set(position);
        assert_eq!(ws.get(Id::WILDCARD), WriteKind::ToStage);
    }

    #[test]
    fn test_pattern_lookup_scans_concrete_writes() {
        let (_, likes, apples, pears) = ids();
        let mut ws = WriteState::new();
        ws.set(Id::pair(likes, apples));
        assert_eq!(ws.get(Id::pair(likes, Id::WILDCARD)), WriteKind::ToStage);
        assert_eq!(ws.get(Id::pair(Id::WILDCARD, pears)), WriteKind::None);
    }

    #[test]
    fn test_pattern_write_matches_concrete_reads() {
        let (position, likes, apples, pears) = ids();
        let mut ws = WriteState::new();
        ws.set(Id::pair(likes, Id::WILDCARD));
        assert_eq!(ws.get(Id::pair(likes, apples)), WriteKind::ToStage);
        assert_eq!(ws.get(Id::pair(likes, pears)), WriteKind::ToStage);
        assert_eq!(ws.get(position), WriteKind::None);
    }

    #[test]
    fn test_wildcard_write_sets_barrier() {
        let (position, likes, ..) = ids();
        let mut ws = WriteState::new();
        ws.set(Id::WILDCARD);
        assert_eq!(ws.get(position), WriteKind::ToStage);
        assert_eq!(ws.get(likes), WriteKind::ToStage);
    }

    #[test]
    fn test_reset_clears_everything() {
        let (position, likes, ..) = ids();
        let mut ws = WriteState::new();
        ws.set(position);
        ws.set(Id::pair(likes, Id::WILDCARD));
        ws.set(Id::WILDCARD);
        ws.reset();
        assert_eq!(ws.get(position), WriteKind::None);
        assert_eq!(ws.get(Id::WILDCARD), WriteKind::None);
    }
}
