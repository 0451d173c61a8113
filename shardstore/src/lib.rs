//! Fetch, index, and serve immutable shards from pluggable mounts.
//!
//! A shard is an opaque, immutable blob of content identified by a [Key] and reachable through a
//! [Mount]. Before a shard can be read, its bytes must be fetched and a full [Index] must be built
//! (or loaded) and registered in an [IndexStore]. Once that has happened, callers acquire a
//! [ShardAccessor] that joins a [Reader] with the shard's [Index] for random-access reads.
//!
//! The lifecycle of every shard is owned by the [lifecycle::Engine], a single actor that applies
//! all state transitions one at a time. Fetching and indexing are slow and fallible, so the engine
//! never performs them itself: it spawns short-lived workers and applies their outcome when they
//! report back.
//!
//! # Status
//!
//! `commonware-shardstore` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use bytes::Bytes;
use std::{
    fmt::{Debug, Display},
    future::Future,
    hash::Hash,
};
use thiserror::Error;

pub mod accessor;
pub use accessor::ShardAccessor;
pub mod index;
pub mod lifecycle;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

/// Used as the key to uniquely identify a shard.
pub trait Key: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {}

impl<T: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static> Key for T {}

/// A handle to the raw bytes of a fetched shard.
///
/// Handles are cheap to clone and every clone reads the same content. Closing consumes the
/// handle, so each handle is closed at most once.
pub trait Reader: Clone + Send + Sync + 'static {
    /// Error returned when reading or closing fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Number of bytes available to read.
    fn size(&self) -> u64;

    /// Read `len` bytes starting at `offset`.
    fn read_at(
        &self,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;

    /// Release any resources held by this handle.
    fn close(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Capability used to fetch the raw bytes of a shard.
///
/// The engine never calls [Mount::fetch] concurrently for the same shard while that shard is
/// being initialized.
pub trait Mount: Clone + Send + Sync + 'static {
    /// Handle returned by a successful fetch.
    type Reader: Reader;

    /// Error returned when fetching or closing fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch a readable handle to the shard's contents.
    fn fetch(&self) -> impl Future<Output = Result<Self::Reader, Self::Error>> + Send;

    /// Release any resources held by the mount itself.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Structure enabling random-access reads into a shard's content.
pub trait Index: Clone + Send + Sync + 'static {
    /// Number of content bytes the index addresses.
    ///
    /// An index can only be joined with a [Reader] whose size is at least this large.
    fn span(&self) -> u64;
}

/// Builds (or loads an inline) [Index] from the contents of a shard.
pub trait Indexer: Clone + Send + Sync + 'static {
    /// The index produced.
    type Index: Index;

    /// Error returned when the content cannot be indexed.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read or generate the full index of the content behind `reader`.
    ///
    /// This may return quickly (if the content carries an inline index) or scan the entire
    /// content.
    fn index<R: Reader>(
        &self,
        reader: &R,
    ) -> impl Future<Output = Result<Self::Index, Self::Error>> + Send;
}

/// Maps a shard [Key] to its full [Index].
pub trait IndexStore: Clone + Send + Sync + 'static {
    /// Key used to identify shards.
    type Key: Key;

    /// Index stored for each shard.
    type Index: Index;

    /// Error returned by the store.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Retrieve the full index of a shard (possibly constructing it on demand).
    fn get_full_index(
        &self,
        key: &Self::Key,
    ) -> impl Future<Output = Result<Self::Index, Self::Error>> + Send;

    /// Persist a newly computed index for a shard.
    fn add_full_index(
        &self,
        key: Self::Key,
        index: Self::Index,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Returns whether an index is stored for a shard.
    fn has_full_index(
        &self,
        key: &Self::Key,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Remove the index of a shard, returning whether one was stored.
    fn drop_full_index(
        &self,
        key: &Self::Key,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;
}

/// Errors that can occur when interacting with the shard store.
///
/// Collaborator failures are captured by message so that a single failure can be delivered to
/// every caller waiting on the same operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("shard not found: {0}")]
    NotFound(String),
    #[error("shard already registered: {0}")]
    AlreadyRegistered(String),
    #[error("shard is being destroyed: {0}")]
    Destroying(String),
    #[error("shard is referenced: {0} (refs={1})")]
    Referenced(String, u64),
    #[error("shard is initializing: {0}")]
    Busy(String),
    #[error("failed to acquire reader of mount for shard {key}: {reason}")]
    Fetch { key: String, reason: String },
    #[error("failed to read/generate index for shard {key}: {reason}")]
    IndexGenerate { key: String, reason: String },
    #[error("failed to add index for shard {key}: {reason}")]
    IndexAdd { key: String, reason: String },
    #[error("failed to recover index for shard {key}: {reason}")]
    IndexRecover { key: String, reason: String },
    #[error("failed to drop index for shard {key}: {reason}")]
    IndexDrop { key: String, reason: String },
    #[error("failed to join reader and index for shard {key}: {reason}")]
    Accessor { key: String, reason: String },
    #[error("failed to close mount for shard {key}: {reason}")]
    Close { key: String, reason: String },
    #[error("engine closed")]
    Closed,
}
