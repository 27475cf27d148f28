//! Query terms.
//!
//! A [`Term`] is one element of a system's query: the id it refers to, how
//! the system accesses it ([`InOutKind`]), how it combines with neighbouring
//! terms ([`Oper`]), and where the id is matched ([`Source`]).

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::Id;

/// Declared access of a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InOutKind {
    /// Not annotated. Interpreted from the term's source.
    #[default]
    Default,
    /// The term is matched but its data is never accessed.
    None,
    /// The term only filters; its data is never accessed.
    Filter,
    /// Read-only access.
    In,
    /// Write-only access.
    Out,
    /// Read and write access.
    InOut,
}

/// How a term combines with the rest of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Oper {
    /// The id must be present.
    #[default]
    And,
    /// At least one id of a chain of consecutive `Or` terms must be present.
    Or,
    /// The id must be absent.
    Not,
    /// The id may be present.
    Optional,
}

/// Traversal flags of a term source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Traversal {
    /// Match the id on the source itself.
    pub self_: bool,
    /// Match the id on an ancestor of the source.
    pub up: bool,
}

impl Traversal {
    /// Match on the source only.
    pub const SELF: Traversal = Traversal { self_: true, up: false };
    /// Match on ancestors only.
    pub const UP: Traversal = Traversal { self_: false, up: true };
    /// Match on the source, then on ancestors.
    pub const SELF_UP: Traversal = Traversal { self_: true, up: true };
}

impl Default for Traversal {
    fn default() -> Self {
        Self::SELF
    }
}

/// Where a term is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// The entity of the row being iterated.
    This(Traversal),
    /// A fixed entity.
    Entity(Entity, Traversal),
    /// Nothing: the id is passed to the system but never matched. Accesses
    /// through such terms go through the command queue, not the iterated row.
    Nothing,
}

impl Default for Source {
    fn default() -> Self {
        Source::This(Traversal::SELF)
    }
}

/// One term of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    /// The component, tag, or pair the term refers to.
    pub id: Id,
    /// Declared access.
    pub inout: InOutKind,
    /// Operator.
    pub oper: Oper,
    /// Source the id is matched on.
    pub src: Source,
}

impl Term {
    /// A term matching `id` on the iterated entity with default access.
    #[must_use]
    pub fn new(id: Id) -> Self {
        Self {
            id,
            inout: InOutKind::Default,
            oper: Oper::And,
            src: Source::default(),
        }
    }

    /// Set the declared access.
    #[must_use]
    pub fn inout(mut self, inout: InOutKind) -> Self {
        self.inout = inout;
        self
    }

    /// Set the operator.
    #[must_use]
    pub fn oper(mut self, oper: Oper) -> Self {
        self.oper = oper;
        self
    }

    /// Set the source.
    #[must_use]
    pub fn src(mut self, src: Source) -> Self {
        self.src = src;
        self
    }

    /// Returns `true` if the term is matched on the iterated entity.
    #[must_use]
    pub fn matches_this(&self) -> bool {
        matches!(self.src, Source::This(_))
    }

    /// Returns `true` if the term has no source.
    #[must_use]
    pub fn matches_nothing(&self) -> bool {
        matches!(self.src, Source::Nothing)
    }

    /// Returns `true` if the term's data may come from an entity other than
    /// the iterated one.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        match self.src {
            Source::Nothing => false,
            Source::This(traversal) => !traversal.self_,
            Source::Entity(..) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_term_is_owned_this() {
        let term = Term::new(Id::from_name("Position"));
        assert!(term.matches_this());
        assert!(!term.matches_nothing());
        assert!(!term.is_shared());
        assert_eq!(term.inout, InOutKind::Default);
        assert_eq!(term.oper, Oper::And);
    }

    #[test]
    fn test_shared_sources() {
        let id = Id::from_name("Gravity");
        assert!(Term::new(id).src(Source::This(Traversal::UP)).is_shared());
        assert!(Term::new(id).src(Source::Entity(Entity(3), Traversal::SELF)).is_shared());
        assert!(!Term::new(id).src(Source::This(Traversal::SELF_UP)).is_shared());
        assert!(!Term::new(id).src(Source::Nothing).is_shared());
    }
}
