use crate::{Error, Key};
use futures::channel::mpsc;
use prometheus_client::encoding::EncodeLabelValue;
use tracing::error;

/// Operations applied by the control loop.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Op {
    Register,
    Initialize,
    Acquire,
    Release,
    Destroy,
    Info,
    List,
    MakeAvailable,
    Fail,
    Remove,
}

/// The worker operation a failure originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// An initialize operation, identified by the id it was started with.
    Initialize(u64),

    /// An acquire of a shard that was already available, identified by the id of the
    /// initialize operation that made it available.
    Acquire(u64),
}

/// Completion reported by a worker.
pub enum Task<K, R, I> {
    /// An initialize operation fetched and indexed the shard.
    ///
    /// The reader opened by the operation is handed over so that callers waiting on the
    /// operation can be served without another fetch.
    MakeAvailable {
        key: K,
        operation: u64,
        reader: R,
        index: I,
    },

    /// An operation on the shard failed.
    Fail {
        key: K,
        origin: Origin,
        error: Error,
    },

    /// Drop a reference taken when an acquire was admitted.
    Release { key: K },

    /// A destroyed shard released its resources and can be forgotten.
    Remove { key: K, result: Result<(), Error> },
}

impl<K, R, I> Task<K, R, I> {
    pub fn op(&self) -> Op {
        match self {
            Self::MakeAvailable { .. } => Op::MakeAvailable,
            Self::Fail { .. } => Op::Fail,
            Self::Release { .. } => Op::Release,
            Self::Remove { .. } => Op::Remove,
        }
    }
}

/// Submits completions to the control loop.
///
/// Submission only fails once the control loop has exited. Failures are logged and otherwise
/// ignored: any caller waiting on the operation is notified directly by the worker.
pub struct Queue<K, R, I> {
    sender: mpsc::UnboundedSender<Task<K, R, I>>,
}

impl<K, R, I> Clone for Queue<K, R, I> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<K: Key, R, I> Queue<K, R, I> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task<K, R, I>>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }

    pub fn make_available(&self, key: K, operation: u64, reader: R, index: I) {
        self.submit(Task::MakeAvailable {
            key,
            operation,
            reader,
            index,
        });
    }

    pub fn fail(&self, key: K, origin: Origin, error: Error) {
        self.submit(Task::Fail { key, origin, error });
    }

    pub fn release(&self, key: K) {
        self.submit(Task::Release { key });
    }

    pub fn remove(&self, key: K, result: Result<(), Error>) {
        self.submit(Task::Remove { key, result });
    }

    fn submit(&self, task: Task<K, R, I>) {
        if let Err(err) = self.sender.unbounded_send(task) {
            let task = err.into_inner();
            let op = task.op();
            match task {
                Task::MakeAvailable { key, .. }
                | Task::Fail { key, .. }
                | Task::Release { key }
                | Task::Remove { key, .. } => error!(?key, ?op, "failed to queue task"),
            }
        }
    }
}
