//! Mock collaborators for exercising the lifecycle engine.
//!
//! Content handled by these mocks is a sequence of records, each encoded as a big-endian `u32`
//! length followed by the payload (see [encode]). The [Indexer] recovers the offset and length
//! of every record.

use crate::index::Memory;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};
use thiserror::Error;

/// Size of a record header.
const HEADER: u64 = 4;

/// Errors returned by the mocks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("injected: {0}")]
    Injected(String),
    #[error("read out of bounds: offset={0} len={1}")]
    OutOfBounds(u64, usize),
    #[error("malformed record at {0}")]
    Malformed(u64),
    #[error("read failed: {0}")]
    Read(String),
    #[error("gate dropped")]
    Gate,
}

/// Encode `records` as length-prefixed content.
pub fn encode(records: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::new();
    for record in records {
        buf.put_u32(record.len() as u32);
        buf.put_slice(record);
    }
    buf.freeze()
}

/// A failure that can be switched on and off from a test.
#[derive(Clone, Default)]
struct Fault(Arc<Mutex<Option<String>>>);

impl Fault {
    fn set(&self, reason: Option<&str>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = reason.map(str::to_string);
    }

    fn check(&self) -> Result<(), Error> {
        match self.0.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(reason) => Err(Error::Injected(reason.clone())),
            None => Ok(()),
        }
    }
}

/// An in-memory [crate::Reader] that counts how often it (or any clone) was closed.
#[derive(Clone)]
pub struct Reader {
    data: Bytes,
    closes: Arc<AtomicUsize>,
}

impl Reader {
    /// Create a reader over `data`.
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of times a handle sharing this counter was closed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl crate::Reader for Reader {
    type Error = Error;

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let start = usize::try_from(offset).map_err(|_| Error::OutOfBounds(offset, len))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(Error::OutOfBounds(offset, len))?;
        Ok(self.data.slice(start..end))
    }

    async fn close(self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An in-memory [crate::Mount] that records every interaction.
#[derive(Clone)]
pub struct Mount {
    data: Bytes,
    fetches: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    reader_closes: Arc<AtomicUsize>,
    fault: Fault,
    close_fault: Fault,
    gate: Arc<Mutex<Option<Shared<oneshot::Receiver<()>>>>>,
}

impl Mount {
    /// Create a mount serving `data`.
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            fetches: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            reader_closes: Arc::new(AtomicUsize::new(0)),
            fault: Fault::default(),
            close_fault: Fault::default(),
            gate: Arc::new(Mutex::new(None)),
        }
    }

    /// Number of calls to `fetch`.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of calls to `close` on the mount.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of closes across all readers handed out by this mount.
    pub fn reader_closes(&self) -> usize {
        self.reader_closes.load(Ordering::SeqCst)
    }

    /// Make every subsequent fetch fail with `reason` (or succeed again with `None`).
    pub fn fail(&self, reason: Option<&str>) {
        self.fault.set(reason);
    }

    /// Make every subsequent `close` of the mount fail with `reason`.
    pub fn fail_close(&self, reason: Option<&str>) {
        self.close_fault.set(reason);
    }

    /// Hold every subsequent fetch until the returned sender fires.
    ///
    /// If the sender is dropped instead, held fetches fail.
    pub fn hold(&self) -> oneshot::Sender<()> {
        let (sender, receiver) = oneshot::channel();
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(receiver.shared());
        sender
    }

    /// Stop holding fetches.
    pub fn open(&self) {
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl crate::Mount for Mount {
    type Reader = Reader;
    type Error = Error;

    async fn fetch(&self) -> Result<Reader, Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate {
            gate.await.map_err(|_| Error::Gate)?;
        }
        self.fault.check()?;
        Ok(Reader {
            data: self.data.clone(),
            closes: self.reader_closes.clone(),
        })
    }

    async fn close(&self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.close_fault.check()
    }
}

/// Location of every record in some content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<(u64, usize)>,
}

impl Index {
    /// Create an index from `(offset, len)` pairs of record payloads.
    pub fn new(entries: Vec<(u64, usize)>) -> Self {
        Self { entries }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no record is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset and length of the payload of record `i`.
    pub fn get(&self, i: usize) -> Option<(u64, usize)> {
        self.entries.get(i).copied()
    }
}

impl crate::Index for Index {
    fn span(&self) -> u64 {
        self.entries
            .iter()
            .map(|(offset, len)| offset + *len as u64)
            .max()
            .unwrap_or(0)
    }
}

/// Scans length-prefixed content to build an [Index].
#[derive(Clone, Default)]
pub struct Indexer {
    calls: Arc<AtomicUsize>,
    fault: Fault,
}

impl Indexer {
    /// Number of calls to `index`.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with `reason` (or succeed again with `None`).
    pub fn fail(&self, reason: Option<&str>) {
        self.fault.set(reason);
    }
}

impl crate::Indexer for Indexer {
    type Index = Index;
    type Error = Error;

    async fn index<R: crate::Reader>(&self, reader: &R) -> Result<Index, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fault.check()?;

        let size = reader.size();
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < size {
            if size - offset < HEADER {
                return Err(Error::Malformed(offset));
            }
            let header = reader
                .read_at(offset, HEADER as usize)
                .await
                .map_err(|err| Error::Read(err.to_string()))?;
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
            if len > size - offset - HEADER {
                return Err(Error::Malformed(offset));
            }
            entries.push((offset + HEADER, len as usize));
            offset += HEADER + len;
        }
        Ok(Index::new(entries))
    }
}

/// A [Memory] index store whose reads and writes can be made to fail.
#[derive(Clone)]
pub struct Indices<K: crate::Key> {
    memory: Memory<K, Index>,
    gets: Arc<AtomicUsize>,
    get_fault: Fault,
    add_fault: Fault,
    drop_fault: Fault,
}

impl<K: crate::Key> Default for Indices<K> {
    fn default() -> Self {
        Self {
            memory: Memory::default(),
            gets: Arc::new(AtomicUsize::new(0)),
            get_fault: Fault::default(),
            add_fault: Fault::default(),
            drop_fault: Fault::default(),
        }
    }
}

impl<K: crate::Key> Indices<K> {
    /// Number of calls to `get_full_index`.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// The backing store (bypassing injected faults).
    pub fn memory(&self) -> &Memory<K, Index> {
        &self.memory
    }

    /// Make every subsequent `get_full_index` fail with `reason`.
    pub fn fail_get(&self, reason: Option<&str>) {
        self.get_fault.set(reason);
    }

    /// Make every subsequent `add_full_index` fail with `reason`.
    pub fn fail_add(&self, reason: Option<&str>) {
        self.add_fault.set(reason);
    }

    /// Make every subsequent `drop_full_index` fail with `reason`.
    pub fn fail_drop(&self, reason: Option<&str>) {
        self.drop_fault.set(reason);
    }
}

impl<K: crate::Key> crate::IndexStore for Indices<K> {
    type Key = K;
    type Index = Index;
    type Error = Error;

    async fn get_full_index(&self, key: &K) -> Result<Index, Error> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.get_fault.check()?;
        self.memory
            .get_full_index(key)
            .await
            .map_err(|err| Error::Read(err.to_string()))
    }

    async fn add_full_index(&self, key: K, index: Index) -> Result<(), Error> {
        self.add_fault.check()?;
        self.memory
            .add_full_index(key, index)
            .await
            .map_err(|err| Error::Read(err.to_string()))
    }

    async fn has_full_index(&self, key: &K) -> Result<bool, Error> {
        self.memory
            .has_full_index(key)
            .await
            .map_err(|err| Error::Read(err.to_string()))
    }

    async fn drop_full_index(&self, key: &K) -> Result<bool, Error> {
        self.drop_fault.check()?;
        self.memory
            .drop_full_index(key)
            .await
            .map_err(|err| Error::Read(err.to_string()))
    }
}
