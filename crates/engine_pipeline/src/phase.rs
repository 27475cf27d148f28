//! Builtin phases.
//!
//! A phase is an [`Id`] that orders systems: a pipeline lists its phases and
//! runs the systems of each phase in that order. Systems in [`ON_START`] run
//! once, before the first frame.

use engine_term::Id;

pub const ON_START: Id = Id::builtin(1);
pub const PRE_FRAME: Id = Id::builtin(2);
pub const ON_LOAD: Id = Id::builtin(3);
pub const POST_LOAD: Id = Id::builtin(4);
pub const PRE_UPDATE: Id = Id::builtin(5);
pub const ON_UPDATE: Id = Id::builtin(6);
pub const ON_VALIDATE: Id = Id::builtin(7);
pub const POST_UPDATE: Id = Id::builtin(8);
pub const PRE_STORE: Id = Id::builtin(9);
pub const ON_STORE: Id = Id::builtin(10);
pub const POST_FRAME: Id = Id::builtin(11);

/// Phases of the builtin pipeline, in run order.
pub const BUILTIN_PHASES: [Id; 10] = [
    PRE_FRAME,
    ON_LOAD,
    POST_LOAD,
    PRE_UPDATE,
    ON_UPDATE,
    ON_VALIDATE,
    POST_UPDATE,
    PRE_STORE,
    ON_STORE,
    POST_FRAME,
];

/// Human-readable name of a builtin phase.
#[must_use]
pub fn name(phase: Id) -> Option<&'static str> {
    let name = match phase {
        ON_START => "OnStart",
        PRE_FRAME => "PreFrame",
        ON_LOAD => "OnLoad",
        POST_LOAD => "PostLoad",
        PRE_UPDATE => "PreUpdate",
        ON_UPDATE => "OnUpdate",
        ON_VALIDATE => "OnValidate",
        POST_UPDATE => "PostUpdate",
        PRE_STORE => "PreStore",
        ON_STORE => "OnStore",
        POST_FRAME => "PostFrame",
        _ => return None,
    };
    Some(name)
}
