//! Random access into an acquired shard.

use crate::{Error, Index, Key, Reader};
use bytes::Bytes;
use std::fmt;

/// Joins a fetched [Reader] with the shard's [Index].
///
/// An accessor is handed to the caller of a successful acquire and owns its reader. The shard
/// remains referenced until the caller releases it through the
/// [Mailbox](crate::lifecycle::Mailbox).
#[derive(Clone)]
pub struct ShardAccessor<K: Key, R: Reader, I: Index> {
    key: K,
    reader: R,
    index: I,
}

impl<K: Key, R: Reader, I: Index> ShardAccessor<K, R, I> {
    /// Join `reader` and `index` for the shard identified by `key`.
    ///
    /// Fails if the index addresses more content than the reader holds.
    pub fn new(key: K, reader: R, index: I) -> Result<Self, Error> {
        let size = reader.size();
        let span = index.span();
        if span > size {
            return Err(Error::Accessor {
                key: key.to_string(),
                reason: format!("index spans {span} bytes but reader holds {size}"),
            });
        }
        Ok(Self { key, reader, index })
    }

    /// The key of the shard.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The full index of the shard.
    pub fn index(&self) -> &I {
        &self.index
    }

    /// Number of content bytes available.
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Read `len` bytes of shard content starting at `offset`.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, R::Error> {
        self.reader.read_at(offset, len).await
    }

    /// Close the underlying reader.
    pub async fn close(self) -> Result<(), R::Error> {
        self.reader.close().await
    }
}

impl<K: Key, R: Reader, I: Index> fmt::Debug for ShardAccessor<K, R, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardAccessor")
            .field("key", &self.key)
            .field("size", &self.reader.size())
            .field("span", &self.index.span())
            .finish()
    }
}
