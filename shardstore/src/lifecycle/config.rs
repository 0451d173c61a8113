use crate::Error;
use futures::channel::mpsc;
use std::time::Duration;

/// Configuration for the [`Engine`](super::Engine).
pub struct Config<K, S, X> {
    /// The store holding the full index of every shard that has been initialized.
    pub indices: S,

    /// Builds (or loads an inline) index from a freshly fetched shard.
    pub indexer: X,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    /// Deadline applied to every mount fetch and index call made by a worker.
    ///
    /// Expiry is reported as a failure of the stage that timed out.
    pub fetch_timeout: Option<Duration>,

    /// Notified of every failure that moves a shard into
    /// [`State::Errored`](super::State::Errored).
    pub failures: Option<mpsc::UnboundedSender<(K, Error)>>,
}
