use super::shard::{Accessor, ShardInfo};
use crate::{Error, Index, Key, Mount};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Message types that can be sent to the [`Mailbox`].
pub enum Message<K: Key, M: Mount, I: Index> {
    /// Add a shard to the catalog.
    ///
    /// Unless `lazy` is set, the shard is initialized immediately and the responder is resolved
    /// once initialization concludes.
    Register {
        key: K,
        mount: M,
        lazy: bool,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Fetch and index a shard that is new or errored.
    Initialize {
        key: K,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Take a reference to a shard and receive an accessor for it.
    Acquire {
        key: K,
        responder: oneshot::Sender<Result<Accessor<K, M, I>, Error>>,
    },

    /// Drop a reference taken by a successful acquire.
    Release { key: K },

    /// Tear down an unreferenced shard and forget it.
    Destroy {
        key: K,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Inspect a shard.
    Info {
        key: K,
        responder: oneshot::Sender<Result<ShardInfo, Error>>,
    },

    /// Inspect every shard.
    List {
        responder: oneshot::Sender<Vec<(K, ShardInfo)>>,
    },
}

/// Ingress mailbox for [`Engine`](super::Engine).
pub struct Mailbox<K: Key, M: Mount, I: Index> {
    sender: mpsc::Sender<Message<K, M, I>>,
}

impl<K: Key, M: Mount, I: Index> Clone for Mailbox<K, M, I> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<K: Key, M: Mount, I: Index> Mailbox<K, M, I> {
    pub(super) fn new(sender: mpsc::Sender<Message<K, M, I>>) -> Self {
        Self { sender }
    }

    /// Send a message and wait for the engine to respond.
    async fn request<T>(
        &mut self,
        message: impl FnOnce(oneshot::Sender<T>) -> Message<K, M, I>,
    ) -> Result<T, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(message(responder))
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }

    /// Register a shard served by `mount`.
    ///
    /// If `lazy` is false, this waits until the shard has been initialized.
    pub async fn register(&mut self, key: K, mount: M, lazy: bool) -> Result<(), Error> {
        self.request(|responder| Message::Register {
            key,
            mount,
            lazy,
            responder,
        })
        .await?
    }

    /// Fetch and index a shard, waiting until the operation concludes.
    ///
    /// Succeeds immediately if the shard is already available.
    pub async fn initialize(&mut self, key: K) -> Result<(), Error> {
        self.request(|responder| Message::Initialize { key, responder })
            .await?
    }

    /// Acquire a shard.
    ///
    /// On success the shard holds a reference for the caller until [Mailbox::release] is
    /// called with the same key.
    pub async fn acquire(&mut self, key: K) -> Result<Accessor<K, M, I>, Error> {
        self.request(|responder| Message::Acquire { key, responder })
            .await?
    }

    /// Release a reference taken by a successful [Mailbox::acquire].
    pub async fn release(&mut self, key: K) -> Result<(), Error> {
        self.sender
            .send(Message::Release { key })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Destroy an unreferenced shard, waiting until its resources are released.
    pub async fn destroy(&mut self, key: K) -> Result<(), Error> {
        self.request(|responder| Message::Destroy { key, responder })
            .await?
    }

    /// Get a snapshot of a shard.
    pub async fn info(&mut self, key: K) -> Result<ShardInfo, Error> {
        self.request(|responder| Message::Info { key, responder })
            .await?
    }

    /// Get a snapshot of every registered shard.
    pub async fn list(&mut self) -> Result<Vec<(K, ShardInfo)>, Error> {
        self.request(|responder| Message::List { responder }).await
    }
}
