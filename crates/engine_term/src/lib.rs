//! # engine_term
//!
//! Identifiers and query descriptions shared by the frame pipeline scheduler
//! and the systems it runs.
//!
//! This crate provides:
//!
//! - [`Entity`]: lightweight `u64` identifiers for systems and pipelines.
//! - [`EntityAllocator`]: monotonically increasing ID allocator.
//! - [`Id`]: component, tag, pair, and wildcard identifiers.
//! - [`Term`] / [`QueryDesc`]: declarative data access of a system.

pub mod entity;
pub mod id;
pub mod query;
pub mod term;

pub use entity::{Entity, EntityAllocator};
pub use id::Id;
pub use query::QueryDesc;
pub use term::{InOutKind, Oper, Source, Term, Traversal};
