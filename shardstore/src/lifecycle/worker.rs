//! Operations that run outside of the control loop.
//!
//! Workers perform all blocking I/O (fetching, indexing, tearing down) and never touch shard
//! state: they report their outcome to the control loop through the [Queue].

use super::{
    shard::Accessor,
    task::{Origin, Queue},
    waiter::Waiter,
};
use crate::{Error, IndexStore, Indexer, Key, Mount, Reader, ShardAccessor};
use commonware_macros::select;
use commonware_runtime::Clock;
use prometheus_client::metrics::counter::Counter;
use std::{fmt::Display, future::Future, time::Duration};
use tracing::{debug, error, warn};

/// Collaborators shared by every worker.
pub struct Workers<K: Key, M: Mount, S: IndexStore<Key = K, Index = X::Index>, X: Indexer> {
    pub indices: S,
    pub indexer: X,
    pub queue: Queue<K, M::Reader, X::Index>,
    pub timeout: Option<Duration>,
    pub fetches: Counter,
}

impl<K: Key, M: Mount, S: IndexStore<Key = K, Index = X::Index>, X: Indexer> Clone
    for Workers<K, M, S, X>
{
    fn clone(&self) -> Self {
        Self {
            indices: self.indices.clone(),
            indexer: self.indexer.clone(),
            queue: self.queue.clone(),
            timeout: self.timeout,
            fetches: self.fetches.clone(),
        }
    }
}

impl<K: Key, M: Mount, S: IndexStore<Key = K, Index = X::Index>, X: Indexer> Workers<K, M, S, X> {
    /// Fetch the shard, recover its index, and deliver an accessor to `waiter`.
    ///
    /// The caller must have taken a reference on the shard. On failure, that reference is
    /// released and the shard is failed before the error is delivered. `operation` is the
    /// initialize operation that made the shard available.
    pub async fn acquire<E: Clock>(
        self,
        context: E,
        key: K,
        operation: u64,
        mount: M,
        waiter: Waiter<Accessor<K, M, X::Index>>,
    ) {
        let origin = Origin::Acquire(operation);
        self.fetches.inc();
        let reader = match bounded(&context, self.timeout, mount.fetch()).await {
            Ok(reader) => reader,
            Err(reason) => {
                let error = Error::Fetch {
                    key: key.to_string(),
                    reason,
                };
                self.abandon(key, origin, error, waiter);
                return;
            }
        };

        let index = match bounded(&context, self.timeout, self.indices.get_full_index(&key)).await
        {
            Ok(index) => index,
            Err(reason) => {
                close(&key, reader).await;
                let error = Error::IndexRecover {
                    key: key.to_string(),
                    reason,
                };
                self.abandon(key, origin, error, waiter);
                return;
            }
        };

        let accessor = match ShardAccessor::new(key.clone(), reader.clone(), index) {
            Ok(accessor) => accessor,
            Err(error) => {
                close(&key, reader).await;
                self.abandon(key, origin, error, waiter);
                return;
            }
        };

        // Reclaim the reference if the caller stopped listening
        if let Err(Ok(accessor)) = waiter.resolve(Ok(accessor)) {
            debug!(?key, "acquirer dropped");
            if let Err(err) = accessor.close().await {
                error!(?key, ?err, "failed to close mount reader");
            }
            self.queue.release(key);
        }
    }

    /// Fetch the shard, build its index, and store it.
    ///
    /// On success, the open reader is handed to the control loop along with the index.
    pub async fn initialize<E: Clock>(self, context: E, key: K, operation: u64, mount: M) {
        let origin = Origin::Initialize(operation);
        self.fetches.inc();
        let reader = match bounded(&context, self.timeout, mount.fetch()).await {
            Ok(reader) => reader,
            Err(reason) => {
                let error = Error::Fetch {
                    key: key.to_string(),
                    reason,
                };
                self.queue.fail(key, origin, error);
                return;
            }
        };

        let index = match bounded(&context, self.timeout, self.indexer.index(&reader)).await {
            Ok(index) => index,
            Err(reason) => {
                close(&key, reader).await;
                let error = Error::IndexGenerate {
                    key: key.to_string(),
                    reason,
                };
                self.queue.fail(key, origin, error);
                return;
            }
        };

        let add = self.indices.add_full_index(key.clone(), index.clone());
        if let Err(reason) = bounded(&context, self.timeout, add).await {
            close(&key, reader).await;
            let error = Error::IndexAdd {
                key: key.to_string(),
                reason,
            };
            self.queue.fail(key, origin, error);
            return;
        }

        self.queue.make_available(key, operation, reader, index);
    }

    /// Drop the shard's index and close its mount.
    ///
    /// The shard is removed regardless of the outcome.
    pub async fn destroy(self, key: K, mount: M) {
        let mut result = Ok(());
        if let Err(err) = self.indices.drop_full_index(&key).await {
            warn!(?key, ?err, "failed to drop index");
            result = Err(Error::IndexDrop {
                key: key.to_string(),
                reason: err.to_string(),
            });
        }
        if let Err(err) = mount.close().await {
            warn!(?key, ?err, "failed to close mount");
            result = result.and(Err(Error::Close {
                key: key.to_string(),
                reason: err.to_string(),
            }));
        }
        self.queue.remove(key, result);
    }

    /// Release the reference taken for `waiter`, fail the shard, and deliver the error.
    ///
    /// The queued tasks and the delivery are independent: neither suppresses the other.
    fn abandon(
        &self,
        key: K,
        origin: Origin,
        error: Error,
        waiter: Waiter<Accessor<K, M, X::Index>>,
    ) {
        self.queue.release(key.clone());
        self.queue.fail(key.clone(), origin, error.clone());
        if waiter.resolve(Err(error)).is_err() {
            debug!(?key, "acquirer dropped");
        }
    }
}

/// Close `reader`, logging any error.
pub async fn close<K: Key, R: Reader>(key: &K, reader: R) {
    if let Err(err) = reader.close().await {
        error!(?key, ?err, "failed to close mount reader");
    }
}

/// Await `future`, failing with `"timeout"` if it does not complete within `timeout`.
async fn bounded<E: Clock, T, D: Display>(
    context: &E,
    timeout: Option<Duration>,
    future: impl Future<Output = Result<T, D>> + Send,
) -> Result<T, String> {
    let Some(timeout) = timeout else {
        return future.await.map_err(|err| err.to_string());
    };
    select! {
        result = future => {
            result.map_err(|err| err.to_string())
        },
        _ = context.sleep(timeout) => {
            Err("timeout".to_string())
        },
    }
}
