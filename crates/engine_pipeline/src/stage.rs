//! Per-thread command staging.
//!
//! While the world is readonly, systems don't mutate primary storage
//! directly. They push [`Command`]s into the queue of the stage they run
//! on, and the main thread applies every queue, in stage order, at the
//! next merge.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use engine_term::Entity;
use tracing::{trace, warn};

use crate::lock::{lock, write};
use crate::system::{SystemCommand, SystemRegistry};

/// A deferred mutation.
pub enum Command<S> {
    /// Closure applied to primary storage.
    Store(Box<dyn FnOnce(&S) + Send>),
    /// Change to the set of systems.
    System(SystemCommand),
}

impl<S> fmt::Debug for Command<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Store(_) => f.write_str("Store(..)"),
            Command::System(cmd) => f.debug_tuple("System").field(cmd).finish(),
        }
    }
}

/// Summary of a command, as reported to a command observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Store,
    Enable(Entity),
    Disable(Entity),
    Delete(Entity),
}

impl<S> From<&Command<S>> for CommandKind {
    fn from(command: &Command<S>) -> Self {
        match command {
            Command::Store(_) => CommandKind::Store,
            Command::System(SystemCommand::Enable(id)) => CommandKind::Enable(*id),
            Command::System(SystemCommand::Disable(id)) => CommandKind::Disable(*id),
            Command::System(SystemCommand::Delete(id)) => CommandKind::Delete(*id),
        }
    }
}

/// A command being applied during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEvent {
    /// Stage the command was queued on.
    pub stage: usize,
    pub kind: CommandKind,
}

/// Hook invoked for every command applied during a merge.
pub type CommandObserver = Arc<dyn Fn(CommandEvent) + Send + Sync>;

/// Execution context of one thread.
pub struct Stage<S> {
    id: usize,
    queue: Mutex<Vec<Command<S>>>,
}

impl<S> Stage<S> {
    #[must_use]
    pub fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn push(&self, command: Command<S>) {
        lock(&self.queue).push(command);
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Vec<Command<S>> {
        std::mem::take(&mut *lock(&self.queue))
    }
}

impl<S> fmt::Debug for Stage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("queued", &self.len())
            .finish()
    }
}

/// Apply the queues of `stages`, in stage order. Returns the number of
/// commands applied.
///
/// Commands pushed while merging (a store closure deferring more work) land
/// in the emptied queues and are applied by the next merge.
pub(crate) fn merge<S>(
    stages: &[Arc<Stage<S>>],
    store: &S,
    registry: &RwLock<SystemRegistry<S>>,
    observer: Option<&CommandObserver>,
) -> usize {
    let mut applied = 0;
    for stage in stages {
        let commands = stage.take();
        if commands.is_empty() {
            continue;
        }
        trace!(stage = stage.id, commands = commands.len(), "merging stage");
        for command in commands {
            if let Some(observer) = observer {
                observer(CommandEvent {
                    stage: stage.id,
                    kind: CommandKind::from(&command),
                });
            }
            match command {
                Command::Store(apply) => apply(store),
                Command::System(cmd) => {
                    if let Err(e) = write(registry).apply(cmd) {
                        warn!(stage = stage.id, ?cmd, error = %e, "dropped system command");
                    }
                }
            }
            applied += 1;
        }
    }
    applied
}
