//! Query descriptors for system data access declarations.
//!
//! A [`QueryDesc`] declares, term by term, which ids a system reads and
//! writes and where it accesses them. The scheduler walks these terms to find
//! where buffered writes of one system must be merged before another system
//! can observe them.

use serde::{Deserialize, Serialize};

use crate::id::Id;
use crate::term::{InOutKind, Oper, Source, Term, Traversal};

/// Ordered list of terms describing a system's data access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDesc {
    /// Terms in declaration order.
    pub terms: Vec<Term>,
}

impl QueryDesc {
    /// Create a new empty query descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    /// Append an arbitrary term.
    #[must_use]
    pub fn term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    /// Match `id` on the iterated entity without an access annotation.
    #[must_use]
    pub fn with(self, id: Id) -> Self {
        self.term(Term::new(id))
    }

    /// Read `id` on the iterated entity.
    #[must_use]
    pub fn read(self, id: Id) -> Self {
        self.term(Term::new(id).inout(InOutKind::In))
    }

    /// Write `id` on the iterated entity.
    #[must_use]
    pub fn write(self, id: Id) -> Self {
        self.term(Term::new(id).inout(InOutKind::Out))
    }

    /// Read and write `id` on the iterated entity.
    #[must_use]
    pub fn read_write(self, id: Id) -> Self {
        self.term(Term::new(id).inout(InOutKind::InOut))
    }

    /// Match `id` only as a filter.
    #[must_use]
    pub fn filter(self, id: Id) -> Self {
        self.term(Term::new(id).inout(InOutKind::Filter))
    }

    /// Require `id` to be absent on the iterated entity.
    #[must_use]
    pub fn without(self, id: Id) -> Self {
        self.term(Term::new(id).oper(Oper::Not).inout(InOutKind::None))
    }

    /// Require `id` to be absent, declaring that the system will add it.
    #[must_use]
    pub fn adds(self, id: Id) -> Self {
        self.term(Term::new(id).oper(Oper::Not).inout(InOutKind::Out))
    }

    /// Read `id` from an ancestor of the iterated entity.
    #[must_use]
    pub fn read_up(self, id: Id) -> Self {
        self.term(
            Term::new(id)
                .src(Source::This(Traversal::UP))
                .inout(InOutKind::In),
        )
    }

    /// Read `id` through the world (e.g. from another entity) rather than the
    /// iterated row.
    #[must_use]
    pub fn reads_from(self, id: Id) -> Self {
        self.term(Term::new(id).src(Source::Nothing).inout(InOutKind::In))
    }

    /// Write `id` through the command queue rather than the iterated row.
    #[must_use]
    pub fn writes_to(self, id: Id) -> Self {
        self.term(Term::new(id).src(Source::Nothing).inout(InOutKind::Out))
    }

    /// Returns the terms matched on the iterated entity.
    pub fn this_terms(&self) -> impl Iterator<Item = &Term> {
        self.terms.iter().filter(|t| t.matches_this())
    }

    /// Returns `true` if the query iterates rows (has at least one This term).
    #[must_use]
    pub fn has_this_terms(&self) -> bool {
        self.this_terms().next().is_some()
    }

    /// Returns `true` if the query has no terms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluate the `This` terms against one entity, where `has` reports
    /// whether the entity carries an id (or any id matching a pattern).
    ///
    /// `And` requires the id, `Not` forbids it, a run of consecutive `Or`
    /// terms requires at least one of them, and `Optional` never filters.
    pub fn matches_entity(&self, has: impl Fn(Id) -> bool) -> bool {
        let mut terms = self.this_terms().peekable();
        while let Some(term) = terms.next() {
            let ok = match term.oper {
                Oper::And => has(term.id),
                Oper::Not => !has(term.id),
                Oper::Optional => true,
                Oper::Or => {
                    let mut any = has(term.id);
                    while let Some(next) = terms.next_if(|t| t.oper == Oper::Or) {
                        any |= has(next.id);
                    }
                    any
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_preserves_order() {
        let position = Id::from_name("Position");
        let velocity = Id::from_name("Velocity");
        let q = QueryDesc::new().read(velocity).write(position);
        assert_eq!(q.terms.len(), 2);
        assert_eq!(q.terms[0].id, velocity);
        assert_eq!(q.terms[0].inout, InOutKind::In);
        assert_eq!(q.terms[1].id, position);
        assert_eq!(q.terms[1].inout, InOutKind::Out);
    }

    #[test]
    fn test_adds_is_not_out() {
        let q = QueryDesc::new().adds(Id::from_name("Marker"));
        assert_eq!(q.terms[0].oper, Oper::Not);
        assert_eq!(q.terms[0].inout, InOutKind::Out);
        assert!(q.terms[0].matches_this());
    }

    #[test]
    fn test_this_terms() {
        let q = QueryDesc::new()
            .with(Id::from_name("A"))
            .writes_to(Id::from_name("B"))
            .read_up(Id::from_name("C"));
        assert_eq!(q.this_terms().count(), 2);
        assert!(q.has_this_terms());
        assert!(!QueryDesc::new().writes_to(Id::from_name("B")).has_this_terms());
    }

    #[test]
    fn test_matches_entity() {
        let a = Id::from_name("A");
        let b = Id::from_name("B");
        let c = Id::from_name("C");
        let q = QueryDesc::new()
            .with(a)
            .without(b)
            .term(Term::new(c).oper(Oper::Optional));
        assert!(q.matches_entity(|id| id == a));
        assert!(q.matches_entity(|id| id == a || id == c));
        assert!(!q.matches_entity(|id| id == a || id == b));
        assert!(!q.matches_entity(|_| false));

        let either = QueryDesc::new()
            .term(Term::new(a).oper(Oper::Or))
            .term(Term::new(b).oper(Oper::Or));
        assert!(either.matches_entity(|id| id == b));
        assert!(!either.matches_entity(|id| id == c));

        // Sourceless terms don't constrain the matched entity.
        let global = QueryDesc::new().writes_to(a);
        assert!(global.matches_entity(|_| false));
    }

    #[test]
    fn test_query_serializes() {
        let q = QueryDesc::new().read(Id::from_name("Position"));
        let json = serde_json::to_string(&q).unwrap();
        let restored: QueryDesc = serde_json::from_str(&json).unwrap();
        assert_eq!(q, restored);
    }
}
