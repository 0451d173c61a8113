use super::waiter::Waiter;
use crate::{Error, Index, Key, Mount, ShardAccessor};
use std::fmt;

/// Lifecycle state of a shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Registered but never fetched or indexed.
    New,

    /// An initialize operation is in flight.
    Initializing,

    /// Fetched and indexed at least once.
    Available,

    /// The last attempted operation failed (eligible for retry).
    Errored,

    /// Being torn down. No new operation is admitted.
    Destroying,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Initializing => "initializing",
            Self::Available => "available",
            Self::Errored => "errored",
            Self::Destroying => "destroying",
        };
        f.write_str(s)
    }
}

/// Snapshot of a shard, as observed by the control loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardInfo {
    /// Current lifecycle state.
    pub state: State,

    /// Number of outstanding references.
    pub refs: u64,

    /// The last recorded failure, if the shard has not recovered since.
    pub error: Option<Error>,
}

/// Accessor handed to callers of acquire.
pub type Accessor<K, M, I> = ShardAccessor<K, <M as Mount>::Reader, I>;

/// In-memory record of a registered shard.
///
/// Only the control loop reads or writes a [Shard].
pub struct Shard<K: Key, M: Mount, I: Index> {
    pub mount: M,
    pub state: State,
    pub refs: u64,

    /// Identifier of the latest initialize operation.
    pub operation: u64,

    /// Acquires waiting for the in-flight initialize operation.
    pub acquirers: Vec<Waiter<Accessor<K, M, I>>>,

    /// Initializes (and eager registrations) waiting for the in-flight initialize operation.
    pub initializers: Vec<Waiter<()>>,

    /// Destroys waiting for the shard to be removed.
    pub destroyers: Vec<Waiter<()>>,

    pub last_error: Option<Error>,
}

impl<K: Key, M: Mount, I: Index> Shard<K, M, I> {
    pub fn new(mount: M) -> Self {
        Self {
            mount,
            state: State::New,
            refs: 0,
            operation: 0,
            acquirers: Vec::new(),
            initializers: Vec::new(),
            destroyers: Vec::new(),
            last_error: None,
        }
    }

    pub fn info(&self) -> ShardInfo {
        ShardInfo {
            state: self.state,
            refs: self.refs,
            error: self.last_error.clone(),
        }
    }

    /// Drop a reference, returning false if none was held.
    pub fn release(&mut self) -> bool {
        match self.refs.checked_sub(1) {
            Some(refs) => {
                self.refs = refs;
                true
            }
            None => false,
        }
    }

    /// Number of callers waiting on this shard.
    pub fn waiters(&self) -> usize {
        self.acquirers.len() + self.initializers.len() + self.destroyers.len()
    }
}
