//! Track the lifecycle of every registered shard.
//!
//! # Overview
//!
//! The core of the module is the [Engine]. It is responsible for:
//! - Registering shards and the [Mount](crate::Mount) that serves each of them
//! - Initializing shards (fetching their content and building their full index)
//! - Handing out accessors to callers and counting the references they hold
//! - Destroying shards that are no longer referenced
//!
//! # Details
//!
//! Every shard moves through the states described by [State]. All transitions are applied by a
//! single control loop, so no two transitions of a shard ever interleave. Work that may block
//! (fetching, indexing, and teardown) is performed by workers spawned by the loop. Workers report
//! back with completions, which the loop applies before any request that arrives after them.
//!
//! Concurrent requests that require the same shard to be initialized wait on the same operation:
//! a single fetch serves all of them, and a single failure is delivered to all of them. Failed
//! shards are retried by the next request that needs them.
//!
//! The [Mailbox] is used to make requests to the [Engine].

mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::Mailbox;
mod metrics;
mod shard;
pub use shard::{Accessor, ShardInfo, State};
mod task;
mod waiter;
mod worker;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks, Error, Index as _, IndexStore as _};
    use commonware_macros::{select, test_traced};
    use commonware_runtime::{deterministic, Clock, Metrics, Runner, Spawner};
    use futures::{channel::mpsc, StreamExt};
    use std::time::Duration;

    // Enough time for spawned workers to make progress. Cannot be instantaneous as the test
    // runtime requires some time to switch context.
    const A_JIFFY: Duration = Duration::from_millis(10);

    type TestMailbox = Mailbox<u64, mocks::Mount, mocks::Index>;

    struct Harness {
        mailbox: TestMailbox,
        indices: mocks::Indices<u64>,
        indexer: mocks::Indexer,
    }

    fn content() -> bytes::Bytes {
        mocks::encode(&[b"alpha", b"beta", b"gamma"])
    }

    fn start(
        context: deterministic::Context,
        fetch_timeout: Option<Duration>,
        failures: Option<mpsc::UnboundedSender<(u64, Error)>>,
    ) -> Harness {
        let indices = mocks::Indices::default();
        let indexer = mocks::Indexer::default();
        let config = Config {
            indices: indices.clone(),
            indexer: indexer.clone(),
            mailbox_size: 1024,
            fetch_timeout,
            failures,
        };
        let (engine, mailbox) = Engine::new(context.with_label("engine"), config);
        engine.start();
        Harness {
            mailbox,
            indices,
            indexer,
        }
    }

    fn fetch_error(key: u64, reason: &str) -> Error {
        Error::Fetch {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    #[test_traced]
    fn test_acquire_new_shard() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                indexer,
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::New);
            assert_eq!(mount.fetches(), 0);

            // Initialized on first acquire
            let accessor = mailbox.acquire(1).await.unwrap();
            assert_eq!(accessor.index().len(), 3);
            let (offset, len) = accessor.index().get(2).unwrap();
            let record = accessor.read_at(offset, len).await.unwrap();
            assert_eq!(record.as_ref(), b"gamma");
            assert_eq!(mount.fetches(), 1);
            assert_eq!(indexer.calls(), 1);
            assert_eq!(indices.gets(), 0);
            assert!(indices.memory().has_full_index(&1).await.unwrap());

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Available);
            assert_eq!(info.refs, 1);
            assert_eq!(info.error, None);

            accessor.close().await.unwrap();
            assert_eq!(mount.reader_closes(), 1);
            mailbox.release(1).await.unwrap();
            assert_eq!(mailbox.info(1).await.unwrap().refs, 0);
        });
    }

    #[test_traced]
    fn test_acquire_available_shard() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                indexer,
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), false).await.unwrap();
            assert_eq!(mailbox.info(1).await.unwrap().state, State::Available);
            assert_eq!(mount.fetches(), 1);

            // Reader opened by the eager registration is not kept
            context.sleep(A_JIFFY).await;
            assert_eq!(mount.reader_closes(), 1);

            // Every acquire fetches a fresh reader and recovers the stored index
            let first = mailbox.acquire(1).await.unwrap();
            let second = mailbox.acquire(1).await.unwrap();
            assert_eq!(mount.fetches(), 3);
            assert_eq!(indices.gets(), 2);
            assert_eq!(indexer.calls(), 1);
            assert_eq!(first.index(), second.index());
            assert_eq!(mailbox.info(1).await.unwrap().refs, 2);

            mailbox.release(1).await.unwrap();
            mailbox.release(1).await.unwrap();
            assert_eq!(mailbox.info(1).await.unwrap().refs, 0);
        });
    }

    #[test_traced]
    fn test_fetch_failure_on_new_shard() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                indexer,
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mount.fail(Some("offline"));
            mailbox.register(1, mount.clone(), true).await.unwrap();

            let err = mailbox.acquire(1).await.unwrap_err();
            assert_eq!(err, fetch_error(1, "injected: offline"));
            assert_eq!(indexer.calls(), 0);
            assert_eq!(indices.gets(), 0);

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Errored);
            assert_eq!(info.refs, 0);
            assert_eq!(info.error, Some(err));
        });
    }

    #[test_traced]
    fn test_fetch_failure_on_available_shard() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                ..
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), false).await.unwrap();

            mount.fail(Some("offline"));
            let err = mailbox.acquire(1).await.unwrap_err();
            assert_eq!(err, fetch_error(1, "injected: offline"));
            assert_eq!(indices.gets(), 0);

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Errored);
            assert_eq!(info.refs, 0);
            assert_eq!(info.error, Some(err));
        });
    }

    #[test_traced]
    fn test_index_recovery_failure_closes_reader() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                ..
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), false).await.unwrap();
            context.sleep(A_JIFFY).await;
            let closes = mount.reader_closes();

            indices.fail_get(Some("corrupt"));
            let err = mailbox.acquire(1).await.unwrap_err();
            assert_eq!(
                err,
                Error::IndexRecover {
                    key: "1".to_string(),
                    reason: "injected: corrupt".to_string(),
                }
            );
            assert_eq!(mount.reader_closes(), closes + 1);

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Errored);
            assert_eq!(info.refs, 0);

            // Retried by the next acquire
            indices.fail_get(None);
            let accessor = mailbox.acquire(1).await.unwrap();
            assert_eq!(accessor.index().len(), 3);
            assert_eq!(mailbox.info(1).await.unwrap().state, State::Available);
        });
    }

    #[test_traced]
    fn test_accessor_join_failure() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                ..
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), false).await.unwrap();
            context.sleep(A_JIFFY).await;
            let closes = mount.reader_closes();

            // Replace the stored index with one addressing more than the shard holds
            let oversized = mocks::Index::new(vec![(0, 1024)]);
            assert!(oversized.span() > content().len() as u64);
            indices
                .memory()
                .add_full_index(1, oversized)
                .await
                .unwrap();

            let err = mailbox.acquire(1).await.unwrap_err();
            assert!(matches!(err, Error::Accessor { ref key, .. } if key == "1"));
            assert_eq!(mount.reader_closes(), closes + 1);

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Errored);
            assert_eq!(info.refs, 0);
        });
    }

    #[test_traced]
    fn test_concurrent_acquires_share_fetch() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            let gate = mount.hold();

            let mut handles = Vec::new();
            for i in 0..3 {
                let mut mailbox = mailbox.clone();
                handles.push(
                    context
                        .with_label(&format!("acquirer_{i}"))
                        .spawn(|_| async move { mailbox.acquire(1).await }),
                );
            }
            context.sleep(A_JIFFY).await;

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Initializing);
            assert_eq!(info.refs, 3);
            assert_eq!(mount.fetches(), 1);

            gate.send(()).unwrap();
            let mut accessors = Vec::new();
            for handle in handles {
                accessors.push(handle.await.unwrap().unwrap());
            }
            assert_eq!(mount.fetches(), 1);
            assert!(accessors.windows(2).all(|w| w[0].index() == w[1].index()));

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Available);
            assert_eq!(info.refs, 3);
        });
    }

    #[test_traced]
    fn test_concurrent_acquires_share_failure() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            let gate = mount.hold();

            let mut handles = Vec::new();
            for i in 0..2 {
                let mut mailbox = mailbox.clone();
                handles.push(
                    context
                        .with_label(&format!("acquirer_{i}"))
                        .spawn(|_| async move { mailbox.acquire(1).await }),
                );
            }
            context.sleep(A_JIFFY).await;
            assert_eq!(mailbox.info(1).await.unwrap().refs, 2);

            // Fail the held fetch
            drop(gate);
            for handle in handles {
                let err = handle.await.unwrap().unwrap_err();
                assert_eq!(err, fetch_error(1, "gate dropped"));
            }
            assert_eq!(mount.fetches(), 1);

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Errored);
            assert_eq!(info.refs, 0);
        });
    }

    #[test_traced]
    fn test_retry_after_failure() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mount.fail(Some("offline"));
            let err = mailbox.register(1, mount.clone(), false).await.unwrap_err();
            assert_eq!(err, fetch_error(1, "injected: offline"));
            assert_eq!(mailbox.info(1).await.unwrap().state, State::Errored);

            mount.fail(None);
            mailbox.initialize(1).await.unwrap();
            assert_eq!(mount.fetches(), 2);

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Available);
            assert_eq!(info.error, None);

            // Initializing an available shard is a no-op
            mailbox.initialize(1).await.unwrap();
            assert_eq!(mount.fetches(), 2);
        });
    }

    #[test_traced]
    fn test_concurrent_initializes_share_fetch() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            let gate = mount.hold();

            let mut handles = Vec::new();
            for i in 0..2 {
                let mut mailbox = mailbox.clone();
                handles.push(
                    context
                        .with_label(&format!("initializer_{i}"))
                        .spawn(|_| async move { mailbox.initialize(1).await }),
                );
            }
            context.sleep(A_JIFFY).await;
            assert_eq!(mount.fetches(), 1);

            gate.send(()).unwrap();
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
            assert_eq!(mount.fetches(), 1);
            assert_eq!(mailbox.info(1).await.unwrap().state, State::Available);
        });
    }

    #[test_traced]
    fn test_dropped_acquirer_is_released() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            let gate = mount.hold();

            // Stop waiting before the shard is initialized
            let mut waiting = mailbox.clone();
            select! {
                _ = waiting.acquire(1) => {
                    panic!("acquire should be held");
                },
                _ = context.sleep(A_JIFFY) => {},
            }
            assert_eq!(mailbox.info(1).await.unwrap().refs, 1);

            gate.send(()).unwrap();
            context.sleep(A_JIFFY).await;
            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Available);
            assert_eq!(info.refs, 0);
            assert_eq!(mount.reader_closes(), 1);
        });
    }

    #[test_traced]
    fn test_register() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let lazy = mocks::Mount::new(content());
            mailbox.register(1, lazy.clone(), true).await.unwrap();
            assert_eq!(lazy.fetches(), 0);

            let eager = mocks::Mount::new(content());
            mailbox.register(2, eager.clone(), false).await.unwrap();
            assert_eq!(eager.fetches(), 1);
            assert_eq!(mailbox.info(2).await.unwrap().state, State::Available);

            // Duplicate registration leaves the original untouched
            let err = mailbox
                .register(1, mocks::Mount::new(content()), false)
                .await
                .unwrap_err();
            assert_eq!(err, Error::AlreadyRegistered("1".to_string()));
            assert_eq!(mailbox.info(1).await.unwrap().state, State::New);

            // Unknown shards
            assert_eq!(
                mailbox.info(3).await.unwrap_err(),
                Error::NotFound("3".to_string())
            );
            assert_eq!(
                mailbox.initialize(3).await.unwrap_err(),
                Error::NotFound("3".to_string())
            );
            assert_eq!(
                mailbox.acquire(3).await.unwrap_err(),
                Error::NotFound("3".to_string())
            );
        });
    }

    #[test_traced]
    fn test_release_unreferenced_shard() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            mailbox
                .register(1, mocks::Mount::new(content()), true)
                .await
                .unwrap();
            mailbox.release(1).await.unwrap();
            mailbox.release(2).await.unwrap();

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::New);
            assert_eq!(info.refs, 0);
        });
    }

    #[test_traced]
    fn test_destroy() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                ..
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), false).await.unwrap();
            let accessor = mailbox.acquire(1).await.unwrap();

            // Referenced shards cannot be destroyed
            let err = mailbox.destroy(1).await.unwrap_err();
            assert_eq!(err, Error::Referenced("1".to_string(), 1));
            assert_eq!(mount.closes(), 0);

            accessor.close().await.unwrap();
            mailbox.release(1).await.unwrap();
            mailbox.destroy(1).await.unwrap();
            assert_eq!(mount.closes(), 1);
            assert!(!indices.memory().has_full_index(&1).await.unwrap());

            assert_eq!(
                mailbox.info(1).await.unwrap_err(),
                Error::NotFound("1".to_string())
            );
            assert_eq!(
                mailbox.acquire(1).await.unwrap_err(),
                Error::NotFound("1".to_string())
            );
            assert_eq!(
                mailbox.destroy(1).await.unwrap_err(),
                Error::NotFound("1".to_string())
            );

            // The key can be registered again
            mailbox.register(1, mount.clone(), true).await.unwrap();
            assert_eq!(mailbox.info(1).await.unwrap().state, State::New);
        });
    }

    #[test_traced]
    fn test_destroy_initializing_shard() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            let gate = mount.hold();

            let mut initializer = mailbox.clone();
            let handle = context
                .with_label("initializer")
                .spawn(|_| async move { initializer.initialize(1).await });
            context.sleep(A_JIFFY).await;

            let err = mailbox.destroy(1).await.unwrap_err();
            assert_eq!(err, Error::Busy("1".to_string()));

            gate.send(()).unwrap();
            handle.await.unwrap().unwrap();
            mailbox.destroy(1).await.unwrap();
            assert_eq!(mount.closes(), 1);
        });
    }

    #[test_traced]
    fn test_index_generate_failure() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indexer,
                ..
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            indexer.fail(Some("unsupported"));

            let err = mailbox.register(1, mount.clone(), false).await.unwrap_err();
            assert_eq!(
                err,
                Error::IndexGenerate {
                    key: "1".to_string(),
                    reason: "injected: unsupported".to_string(),
                }
            );
            assert_eq!(mount.reader_closes(), 1);
            assert_eq!(mailbox.info(1).await.unwrap().state, State::Errored);
        });
    }

    #[test_traced]
    fn test_index_add_failure() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                ..
            } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            indices.fail_add(Some("full"));

            let err = mailbox.acquire(1).await.unwrap_err();
            assert_eq!(
                err,
                Error::IndexAdd {
                    key: "1".to_string(),
                    reason: "injected: full".to_string(),
                }
            );
            assert_eq!(mount.reader_closes(), 1);

            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Errored);
            assert_eq!(info.refs, 0);
        });
    }

    #[test_traced]
    fn test_fetch_timeout() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let timeout = Some(Duration::from_secs(1));
            let Harness { mut mailbox, .. } = start(context.clone(), timeout, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            let _gate = mount.hold();

            let err = mailbox.acquire(1).await.unwrap_err();
            assert_eq!(err, fetch_error(1, "timeout"));
            assert_eq!(mailbox.info(1).await.unwrap().state, State::Errored);
        });
    }

    #[test_traced]
    fn test_failures_are_reported() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let (sender, mut receiver) = mpsc::unbounded();
            let Harness { mut mailbox, .. } = start(context.clone(), None, Some(sender));
            let mount = mocks::Mount::new(content());
            mount.fail(Some("offline"));
            mailbox.register(1, mount.clone(), true).await.unwrap();

            let err = mailbox.acquire(1).await.unwrap_err();
            assert_eq!(receiver.next().await, Some((1, err)));

            // Successes are not reported
            mount.fail(None);
            mailbox.acquire(1).await.unwrap();
            context.sleep(A_JIFFY).await;
            assert!(receiver.try_recv().is_err());
        });
    }

    #[test_traced]
    fn test_list() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let broken = mocks::Mount::new(content());
            broken.fail(Some("offline"));
            mailbox
                .register(1, mocks::Mount::new(content()), true)
                .await
                .unwrap();
            mailbox
                .register(2, mocks::Mount::new(content()), false)
                .await
                .unwrap();
            mailbox.register(3, broken, false).await.unwrap_err();

            let mut shards = mailbox.list().await.unwrap();
            shards.sort_by_key(|(key, _)| *key);
            let states: Vec<_> = shards.iter().map(|(key, info)| (*key, info.state)).collect();
            assert_eq!(
                states,
                vec![(1, State::New), (2, State::Available), (3, State::Errored)]
            );
            assert_eq!(shards[2].1.error, Some(fetch_error(3, "injected: offline")));
        });
    }

    #[test_traced]
    fn test_destroy_failure_still_removes() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness {
                mut mailbox,
                indices,
                ..
            } = start(context.clone(), None, None);
            let first = mocks::Mount::new(content());
            let second = mocks::Mount::new(content());
            mailbox.register(1, first.clone(), false).await.unwrap();
            mailbox.register(2, second.clone(), false).await.unwrap();

            // Mount close fails
            first.fail_close(Some("busy"));
            let err = mailbox.destroy(1).await.unwrap_err();
            assert_eq!(
                err,
                Error::Close {
                    key: "1".to_string(),
                    reason: "injected: busy".to_string(),
                }
            );
            assert_eq!(first.closes(), 1);
            assert!(!indices.memory().has_full_index(&1).await.unwrap());
            assert_eq!(
                mailbox.info(1).await.unwrap_err(),
                Error::NotFound("1".to_string())
            );

            // Index drop fails (the mount is still closed and the first failure is reported)
            indices.fail_drop(Some("locked"));
            second.fail_close(Some("busy"));
            let err = mailbox.destroy(2).await.unwrap_err();
            assert_eq!(
                err,
                Error::IndexDrop {
                    key: "2".to_string(),
                    reason: "injected: locked".to_string(),
                }
            );
            assert_eq!(second.closes(), 1);
            assert_eq!(
                mailbox.info(2).await.unwrap_err(),
                Error::NotFound("2".to_string())
            );
        });
    }

    #[test_traced]
    fn test_stale_acquire_failure_is_ignored() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), false).await.unwrap();

            // Hold an acquire of the available shard
            let held = mount.hold();
            let mut waiting = mailbox.clone();
            let stale = context
                .with_label("stale")
                .spawn(|_| async move { waiting.acquire(1).await });
            context.sleep(A_JIFFY).await;

            // Fail the shard with another acquire
            mount.open();
            mount.fail(Some("offline"));
            mailbox.acquire(1).await.unwrap_err();
            assert_eq!(mailbox.info(1).await.unwrap().state, State::Errored);

            // Start initializing the shard again
            mount.fail(None);
            let gate = mount.hold();
            let mut waiting = mailbox.clone();
            let current = context
                .with_label("current")
                .spawn(|_| async move { waiting.acquire(1).await });
            context.sleep(A_JIFFY).await;
            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Initializing);
            assert_eq!(info.refs, 2);

            // The held acquire fails while the shard is initializing
            drop(held);
            let err = stale.await.unwrap().unwrap_err();
            assert_eq!(err, fetch_error(1, "gate dropped"));
            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Initializing);
            assert_eq!(info.refs, 1);
            assert_eq!(info.error, Some(err));

            // The in-flight initialize is unaffected
            gate.send(()).unwrap();
            current.await.unwrap().unwrap();
            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Available);
            assert_eq!(info.refs, 1);
            assert_eq!(info.error, None);
        });
    }

    #[test_traced]
    fn test_late_acquire_failure_is_ignored() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let (sender, mut receiver) = mpsc::unbounded();
            let Harness { mut mailbox, .. } = start(context.clone(), None, Some(sender));
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), false).await.unwrap();

            // Hold an acquire of the available shard
            let held = mount.hold();
            let mut waiting = mailbox.clone();
            let late = context
                .with_label("late")
                .spawn(|_| async move { waiting.acquire(1).await });
            context.sleep(A_JIFFY).await;

            // Fail the shard and initialize it again
            mount.open();
            mount.fail(Some("offline"));
            let err = mailbox.acquire(1).await.unwrap_err();
            assert_eq!(receiver.next().await, Some((1, err)));
            mount.fail(None);
            mailbox.acquire(1).await.unwrap();
            assert_eq!(mailbox.info(1).await.unwrap().state, State::Available);

            // The held acquire fails after the shard recovered
            drop(held);
            let err = late.await.unwrap().unwrap_err();
            assert_eq!(err, fetch_error(1, "gate dropped"));
            let info = mailbox.info(1).await.unwrap();
            assert_eq!(info.state, State::Available);
            assert_eq!(info.refs, 1);
            assert!(receiver.try_recv().is_err());
        });
    }

    #[test_traced]
    fn test_shutdown_closes_pending_requests() {
        let runner = deterministic::Runner::timed(Duration::from_secs(10));
        runner.start(|context| async move {
            let Harness { mut mailbox, .. } = start(context.clone(), None, None);
            let mount = mocks::Mount::new(content());
            mailbox.register(1, mount.clone(), true).await.unwrap();
            let _gate = mount.hold();

            let mut waiting = mailbox.clone();
            let handle = context
                .with_label("acquirer")
                .spawn(|_| async move { waiting.acquire(1).await });
            context.sleep(A_JIFFY).await;

            context.stop(0);
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err, Error::Closed);
            assert_eq!(mailbox.info(1).await.unwrap_err(), Error::Closed);
        });
    }
}
