//! Component, tag, and pair identifiers.
//!
//! An [`Id`] names something a query term can refer to: a plain component or
//! tag, a `(relationship, target)` pair, or the wildcard sentinel. Ids that
//! contain a wildcard are *patterns*; [`Id::matches`] resolves them against
//! concrete ids.
//!
//! ## Name-derived identity
//!
//! [`Id::from_name`] hashes a component name with FNV-1a 64-bit and folds the
//! result into the 31-bit index space, skipping the range reserved for
//! builtin ids (phases, the wildcard).
//!
//! ## Layout
//!
//! ```text
//! plain:  0 ........................ | index (31 bits)
//! pair:   1 | first index (31 bits)  | second index (32 bits, top bit clear)
//! ```

use serde::{Deserialize, Serialize};

/// A component, tag, or pair identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(pub u64);

impl Id {
    /// Flag bit marking a pair.
    const PAIR_FLAG: u64 = 1 << 63;

    /// Mask for a single 31-bit index.
    const INDEX_MASK: u64 = 0x7fff_ffff;

    /// Index reserved for the wildcard.
    const WILDCARD_INDEX: u64 = Self::INDEX_MASK;

    /// Indices below this value are reserved for builtin ids.
    pub const FIRST_USER_INDEX: u32 = 256;

    /// FNV-1a 64-bit offset basis.
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

    /// FNV-1a 64-bit prime.
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    /// The wildcard sentinel. Matches any id.
    pub const WILDCARD: Id = Id(Self::WILDCARD_INDEX);

    /// The null id. Never matched.
    pub const NONE: Id = Id(0);

    /// Create a plain id from a raw 31-bit index.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not fit in 31 bits.
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        assert!((index as u64) <= Self::INDEX_MASK, "id index out of range");
        Self(index as u64)
    }

    /// A builtin id in the reserved range (`index < FIRST_USER_INDEX`).
    #[must_use]
    pub const fn builtin(index: u32) -> Self {
        assert!(index < Self::FIRST_USER_INDEX, "builtin id out of reserved range");
        Self(index as u64)
    }

    /// Derive an id from a name using FNV-1a 64-bit.
    ///
    /// The same name always produces the same id, and never collides with a
    /// builtin id or the wildcard.
    #[must_use]
    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = Self::FNV_OFFSET_BASIS;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(Self::FNV_PRIME);
            i += 1;
        }
        let folded = (hash ^ (hash >> 32)) & Self::INDEX_MASK;
        let first = Self::FIRST_USER_INDEX as u64;
        let span = Self::WILDCARD_INDEX - first;
        Self(first + folded % span)
    }

    /// Build a `(first, second)` pair.
    ///
    /// # Panics
    ///
    /// Panics if either side is itself a pair.
    #[must_use]
    pub const fn pair(first: Id, second: Id) -> Self {
        assert!(!first.is_pair() && !second.is_pair(), "pair sides must be plain ids");
        Self(Self::PAIR_FLAG | (first.0 << 32) | second.0)
    }

    /// Returns `true` if this id is a pair.
    #[must_use]
    pub const fn is_pair(self) -> bool {
        self.0 & Self::PAIR_FLAG != 0
    }

    /// The first element of a pair, or the id itself for plain ids.
    #[must_use]
    pub const fn first(self) -> Id {
        if self.is_pair() {
            Id((self.0 >> 32) & Self::INDEX_MASK)
        } else {
            self
        }
    }

    /// The second element of a pair, or [`Id::NONE`] for plain ids.
    #[must_use]
    pub const fn second(self) -> Id {
        if self.is_pair() {
            Id(self.0 & 0xffff_ffff)
        } else {
            Id::NONE
        }
    }

    /// Returns `true` if this id is the wildcard or a pair with a wildcard side.
    #[must_use]
    pub const fn is_wildcard(self) -> bool {
        if self.is_pair() {
            self.first().0 == Self::WILDCARD_INDEX || self.second().0 == Self::WILDCARD_INDEX
        } else {
            self.0 == Self::WILDCARD_INDEX
        }
    }

    /// Returns `true` if `self` is matched by `pattern`.
    ///
    /// A concrete pattern only matches itself. The wildcard matches every id.
    /// A pair pattern matches pairs whose sides equal the pattern's sides or
    /// are matched by a wildcard side.
    #[must_use]
    pub fn matches(self, pattern: Id) -> bool {
        if self == pattern || pattern == Id::WILDCARD {
            return true;
        }
        if !pattern.is_pair() || !self.is_pair() {
            return false;
        }
        let side = |actual: Id, expected: Id| expected == Id::WILDCARD || actual == expected;
        side(self.first(), pattern.first()) && side(self.second(), pattern.second())
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Id::WILDCARD {
            return f.write_str("*");
        }
        if self.is_pair() {
            write!(f, "({}, {})", self.first(), self.second())
        } else {
            write!(f, "#{}", self.0)
        }
    }
}
