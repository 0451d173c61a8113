use super::{
    ingress::{Mailbox, Message},
    metrics,
    shard::{Accessor, Shard, State},
    task::{Op, Origin, Queue, Task},
    waiter::Waiter,
    worker::{self, Workers},
    Config,
};
use crate::{Error, IndexStore, Indexer, Key, Mount, ShardAccessor};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{channel::mpsc, StreamExt};
use std::collections::HashMap;
use tracing::{debug, error, trace, warn};

/// Instance of the shard lifecycle engine.
///
/// It is responsible for:
/// - Owning the state of every registered shard
/// - Applying requests from the [Mailbox] and completions from workers, one at a time
/// - Spawning workers for any fetch, indexing, or teardown a request requires
/// - Resolving callers waiting on an operation once it concludes
pub struct Engine<
    E: Clock + Spawner + Metrics,
    K: Key,
    M: Mount,
    S: IndexStore<Key = K, Index = X::Index>,
    X: Indexer,
> {
    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    context: E,
    workers: Workers<K, M, S, X>,
    failures: Option<mpsc::UnboundedSender<(K, Error)>>,

    ////////////////////////////////////////
    // Messaging
    ////////////////////////////////////////
    /// The mailbox for receiving requests.
    mailbox_receiver: mpsc::Receiver<Message<K, M, X::Index>>,

    /// Completions reported by workers.
    completions: mpsc::UnboundedReceiver<Task<K, M::Reader, X::Index>>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    /// Every registered shard.
    shards: HashMap<K, Shard<K, M, X::Index>>,

    /// Identifier assigned to the next initialize operation.
    next_operation: u64,

    ////////////////////////////////////////
    // Metrics
    ////////////////////////////////////////
    metrics: metrics::Metrics,
}

impl<
        E: Clock + Spawner + Metrics,
        K: Key,
        M: Mount,
        S: IndexStore<Key = K, Index = X::Index>,
        X: Indexer,
    > Engine<E, K, M, S, X>
{
    /// Creates a new engine with the given context and configuration.
    /// Returns the engine and a mailbox for sending requests to the engine.
    pub fn new(context: E, cfg: Config<K, S, X>) -> (Self, Mailbox<K, M, X::Index>) {
        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let (queue, completions) = Queue::new();
        let metrics = metrics::Metrics::init(context.clone());
        let workers = Workers {
            indices: cfg.indices,
            indexer: cfg.indexer,
            queue,
            timeout: cfg.fetch_timeout,
            fetches: metrics.fetches.clone(),
        };

        let result = Self {
            context,
            workers,
            failures: cfg.failures,
            mailbox_receiver,
            completions,
            shards: HashMap::new(),
            next_operation: 0,
            metrics,
        };

        (result, Mailbox::new(mailbox_sender))
    }

    /// Starts the engine.
    pub fn start(self) -> Handle<()> {
        let context = self.context.with_label("control");
        context.spawn(|_| self.run())
    }

    /// Inner run loop called by `start`.
    async fn run(mut self) {
        let mut shutdown = self.context.stopped();

        loop {
            // Apply completions before admitting new requests
            self.drain_completions();
            self.update_gauges();

            select! {
                // Handle shutdown signal
                _ = &mut shutdown => {
                    debug!("shutdown");
                    return;
                },

                // Handle worker completions
                task = self.completions.next() => {
                    let Some(task) = task else {
                        error!("completion queue closed");
                        return;
                    };
                    self.handle_task(task);
                },

                // Handle mailbox messages
                mail = self.mailbox_receiver.next() => {
                    let Some(msg) = mail else {
                        debug!("mailbox closed");
                        return;
                    };

                    // Completions reported before this request was sent must be visible to it
                    self.drain_completions();
                    self.handle_message(msg);
                },
            }
        }
    }

    ////////////////////////////////////////
    // Dispatch
    ////////////////////////////////////////

    fn handle_message(&mut self, msg: Message<K, M, X::Index>) {
        match msg {
            Message::Register {
                key,
                mount,
                lazy,
                responder,
            } => {
                trace!(?key, lazy, "mailbox: register");
                self.record(Op::Register);
                self.handle_register(key, mount, lazy, Waiter::new(responder));
            }
            Message::Initialize { key, responder } => {
                trace!(?key, "mailbox: initialize");
                self.record(Op::Initialize);
                self.handle_initialize(key, Waiter::new(responder));
            }
            Message::Acquire { key, responder } => {
                trace!(?key, "mailbox: acquire");
                self.record(Op::Acquire);
                self.handle_acquire(key, Waiter::new(responder));
            }
            Message::Release { key } => {
                trace!(?key, "mailbox: release");
                self.record(Op::Release);
                self.handle_release(key);
            }
            Message::Destroy { key, responder } => {
                trace!(?key, "mailbox: destroy");
                self.record(Op::Destroy);
                self.handle_destroy(key, Waiter::new(responder));
            }
            Message::Info { key, responder } => {
                trace!(?key, "mailbox: info");
                self.record(Op::Info);
                let info = self
                    .shards
                    .get(&key)
                    .map(|shard| shard.info())
                    .ok_or_else(|| Error::NotFound(key.to_string()));
                let _ = responder.send(info);
            }
            Message::List { responder } => {
                trace!("mailbox: list");
                self.record(Op::List);
                let all = self
                    .shards
                    .iter()
                    .map(|(key, shard)| (key.clone(), shard.info()))
                    .collect();
                let _ = responder.send(all);
            }
        }
    }

    fn handle_task(&mut self, task: Task<K, M::Reader, X::Index>) {
        self.record(task.op());
        match task {
            Task::MakeAvailable {
                key,
                operation,
                reader,
                index,
            } => {
                trace!(?key, operation, "task: make available");
                self.handle_make_available(key, operation, reader, index);
            }
            Task::Fail { key, origin, error } => {
                trace!(?key, ?origin, "task: fail");
                self.handle_fail(key, origin, error);
            }
            Task::Release { key } => {
                trace!(?key, "task: release");
                self.handle_release(key);
            }
            Task::Remove { key, result } => {
                trace!(?key, "task: remove");
                self.handle_remove(key, result);
            }
        }
    }

    ////////////////////////////////////////
    // Requests
    ////////////////////////////////////////

    /// Handles a `register` request.
    ///
    /// Registration of a known key is rejected. Unless `lazy` is set, the shard is initialized
    /// right away and the waiter is resolved when that concludes.
    fn handle_register(&mut self, key: K, mount: M, lazy: bool, waiter: Waiter<()>) {
        if self.shards.contains_key(&key) {
            warn!(?key, "shard already registered");
            let _ = waiter.resolve(Err(Error::AlreadyRegistered(key.to_string())));
            return;
        }
        let mut shard = Shard::new(mount);
        if lazy {
            let _ = waiter.resolve(Ok(()));
        } else {
            shard.initializers.push(waiter);
            self.start_initialize(&key, &mut shard);
        }
        self.shards.insert(key, shard);
    }

    /// Handles an `initialize` request.
    ///
    /// Requests for a shard that is already being initialized wait on the in-flight operation.
    fn handle_initialize(&mut self, key: K, waiter: Waiter<()>) {
        let Some(mut shard) = self.shards.remove(&key) else {
            let _ = waiter.resolve(Err(Error::NotFound(key.to_string())));
            return;
        };
        match shard.state {
            State::New | State::Errored => {
                shard.initializers.push(waiter);
                self.start_initialize(&key, &mut shard);
            }
            State::Initializing => shard.initializers.push(waiter),
            State::Available => {
                let _ = waiter.resolve(Ok(()));
            }
            State::Destroying => {
                warn!(?key, "initialize of destroying shard");
                let _ = waiter.resolve(Err(Error::Destroying(key.to_string())));
            }
        }
        self.shards.insert(key, shard);
    }

    /// Handles an `acquire` request.
    ///
    /// A reference is taken before any work starts. Available shards are fetched directly,
    /// while all other shards are (or already are being) initialized and the waiter is served
    /// from that operation.
    fn handle_acquire(&mut self, key: K, waiter: Waiter<Accessor<K, M, X::Index>>) {
        let Some(mut shard) = self.shards.remove(&key) else {
            let _ = waiter.resolve(Err(Error::NotFound(key.to_string())));
            return;
        };
        match shard.state {
            State::Destroying => {
                warn!(?key, "acquire of destroying shard");
                let _ = waiter.resolve(Err(Error::Destroying(key.to_string())));
            }
            State::Available => {
                shard.refs += 1;
                let workers = self.workers.clone();
                let mount = shard.mount.clone();
                let worker_key = key.clone();
                let operation = shard.operation;
                self.context.with_label("acquire").spawn(move |context| {
                    workers.acquire(context, worker_key, operation, mount, waiter)
                });
            }
            State::Initializing => {
                shard.refs += 1;
                shard.acquirers.push(waiter);
            }
            State::New | State::Errored => {
                shard.refs += 1;
                shard.acquirers.push(waiter);
                self.start_initialize(&key, &mut shard);
            }
        }
        self.shards.insert(key, shard);
    }

    /// Handles a `release` request (from a caller or a failed acquire).
    fn handle_release(&mut self, key: K) {
        let Some(shard) = self.shards.get_mut(&key) else {
            warn!(?key, "release of unknown shard");
            return;
        };
        if !shard.release() {
            warn!(?key, "release of unreferenced shard");
        }
    }

    /// Handles a `destroy` request.
    ///
    /// Only shards without references or an in-flight initialize can be destroyed.
    fn handle_destroy(&mut self, key: K, waiter: Waiter<()>) {
        let Some(shard) = self.shards.get_mut(&key) else {
            let _ = waiter.resolve(Err(Error::NotFound(key.to_string())));
            return;
        };
        match shard.state {
            State::Destroying => shard.destroyers.push(waiter),
            State::Initializing => {
                warn!(?key, "destroy of initializing shard");
                let _ = waiter.resolve(Err(Error::Busy(key.to_string())));
            }
            _ if shard.refs > 0 => {
                warn!(?key, refs = shard.refs, "destroy of referenced shard");
                let _ = waiter.resolve(Err(Error::Referenced(key.to_string(), shard.refs)));
            }
            _ => {
                debug!(?key, "destroying shard");
                shard.state = State::Destroying;
                shard.destroyers.push(waiter);
                let workers = self.workers.clone();
                let mount = shard.mount.clone();
                self.context
                    .with_label("destroy")
                    .spawn(move |_| workers.destroy(key, mount));
            }
        }
    }

    ////////////////////////////////////////
    // Completions
    ////////////////////////////////////////

    /// Handles the successful completion of an initialize operation.
    ///
    /// Acquires waiting on the operation are served from the reader it opened.
    fn handle_make_available(
        &mut self,
        key: K,
        operation: u64,
        reader: M::Reader,
        index: X::Index,
    ) {
        let Some(mut shard) = self.shards.remove(&key) else {
            warn!(?key, operation, "completion for unknown shard");
            self.spawn_close(key, reader);
            return;
        };
        if shard.state != State::Initializing || shard.operation != operation {
            warn!(?key, operation, state = %shard.state, "stale initialize completion");
            self.shards.insert(key.clone(), shard);
            self.spawn_close(key, reader);
            return;
        }

        // Nobody is waiting for the reader
        let acquirers = std::mem::take(&mut shard.acquirers);
        if acquirers.is_empty() {
            Self::make_available(&key, &mut shard);
            self.shards.insert(key.clone(), shard);
            self.spawn_close(key, reader);
            return;
        }

        // Join the reader and index once for every waiting acquire
        let accessor = match ShardAccessor::new(key.clone(), reader.clone(), index) {
            Ok(accessor) => accessor,
            Err(error) => {
                shard.acquirers = acquirers;
                self.shards.insert(key.clone(), shard);
                self.spawn_close(key.clone(), reader);
                self.handle_fail(key, Origin::Initialize(operation), error);
                return;
            }
        };
        Self::make_available(&key, &mut shard);
        let mut unclaimed = Vec::new();
        for waiter in acquirers {
            if let Err(Ok(accessor)) = waiter.resolve(Ok(accessor.clone())) {
                debug!(?key, "acquirer dropped");
                shard.release();
                unclaimed.push(accessor);
            }
        }
        self.shards.insert(key, shard);
        for accessor in unclaimed {
            self.spawn_close_accessor(accessor);
        }
    }

    /// Handles a failed operation.
    ///
    /// Waiters attached to the failed operation receive the error and their references are
    /// dropped. Failures of operations that are no longer current are only recorded.
    fn handle_fail(&mut self, key: K, origin: Origin, error: Error) {
        let Some(shard) = self.shards.get_mut(&key) else {
            warn!(?key, ?origin, ?error, "failure of unknown shard");
            return;
        };
        let current = match origin {
            Origin::Initialize(operation) => operation == shard.operation,
            Origin::Acquire(operation) => {
                operation == shard.operation && shard.state != State::Initializing
            }
        };
        if !current || shard.state == State::Destroying {
            debug!(?key, ?origin, ?error, state = %shard.state, "failure of stale operation");
            shard.last_error = Some(error);
            return;
        }

        warn!(?key, ?origin, ?error, "shard failed");
        shard.state = State::Errored;
        shard.last_error = Some(error.clone());
        for waiter in std::mem::take(&mut shard.acquirers) {
            shard.release();
            let _ = waiter.resolve(Err(error.clone()));
        }
        for waiter in shard.initializers.drain(..) {
            let _ = waiter.resolve(Err(error.clone()));
        }
        self.metrics.failures.inc();
        if let Some(failures) = &self.failures {
            if failures.unbounded_send((key, error)).is_err() {
                debug!("failure receiver dropped");
            }
        }
    }

    /// Handles the removal of a destroyed shard.
    fn handle_remove(&mut self, key: K, result: Result<(), Error>) {
        let Some(shard) = self.shards.remove(&key) else {
            warn!(?key, "removal of unknown shard");
            return;
        };
        debug!(?key, ?result, "shard removed");
        for waiter in shard.destroyers {
            let _ = waiter.resolve(result.clone());
        }
    }

    ////////////////////////////////////////
    // Helpers
    ////////////////////////////////////////

    /// Move `shard` into [State::Available] and resolve its initializers.
    fn make_available(key: &K, shard: &mut Shard<K, M, X::Index>) {
        debug!(?key, operation = shard.operation, "shard available");
        shard.state = State::Available;
        shard.last_error = None;
        for waiter in shard.initializers.drain(..) {
            let _ = waiter.resolve(Ok(()));
        }
    }

    /// Move `shard` into [State::Initializing] and spawn an initialize worker.
    fn start_initialize(&mut self, key: &K, shard: &mut Shard<K, M, X::Index>) {
        let operation = self.next_operation;
        self.next_operation += 1;
        debug!(?key, operation, "initializing shard");
        shard.state = State::Initializing;
        shard.operation = operation;

        let workers = self.workers.clone();
        let mount = shard.mount.clone();
        let key = key.clone();
        self.context
            .with_label("initialize")
            .spawn(move |context| workers.initialize(context, key, operation, mount));
    }

    /// Close `reader` outside of the control loop.
    fn spawn_close(&self, key: K, reader: M::Reader) {
        self.context
            .with_label("close")
            .spawn(move |_| async move { worker::close(&key, reader).await });
    }

    /// Close an accessor that was never delivered outside of the control loop.
    fn spawn_close_accessor(&self, accessor: Accessor<K, M, X::Index>) {
        self.context.with_label("close").spawn(move |_| async move {
            let key = accessor.key().clone();
            if let Err(err) = accessor.close().await {
                error!(?key, ?err, "failed to close mount reader");
            }
        });
    }

    /// Apply every completion that has already been queued.
    fn drain_completions(&mut self) {
        while let Ok(task) = self.completions.try_recv() {
            self.handle_task(task);
        }
    }

    fn record(&self, op: Op) {
        self.metrics.operations.get_or_create(&op.into()).inc();
    }

    fn update_gauges(&self) {
        let (mut initializing, mut available, mut errored, mut references, mut waiters) =
            (0, 0, 0, 0, 0);
        for shard in self.shards.values() {
            match shard.state {
                State::Initializing => initializing += 1,
                State::Available => available += 1,
                State::Errored => errored += 1,
                State::New | State::Destroying => {}
            }
            references += shard.refs as i64;
            waiters += shard.waiters() as i64;
        }
        self.metrics.shards.set(self.shards.len() as i64);
        self.metrics.initializing.set(initializing);
        self.metrics.available.set(available);
        self.metrics.errored.set(errored);
        self.metrics.references.set(references);
        self.metrics.waiters.set(waiters);
    }
}
